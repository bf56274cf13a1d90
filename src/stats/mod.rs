//! 请求统计
//!
//! 只有 StatsCollector 修改聚合数据，其他组件通过 record_* 方法上报

pub mod model;
pub mod store;
pub mod types;

pub use model::UsageRecord;
pub use store::StatsCollector;
pub use types::StatsSnapshot;
