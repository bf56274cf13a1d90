//! 路由与分发

pub mod context;
pub mod dispatcher;
pub mod selector;

pub use context::{AttemptRecord, RequestContext};
pub use dispatcher::{Dispatched, Dispatcher};
