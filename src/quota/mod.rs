//! 调用方认证与每日配额
//!
//! 每个凭据的用量保存在一个打包的原子字 (day << 32 | count) 中，
//! 准入检查与计数在同一次 compare-and-swap 中完成

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::common::auth::constant_time_eq;
use crate::common::mask_secret;
use crate::error::RouterError;
use crate::model::config::{QuotaConfig, QuotaPolicy};
use crate::model::credentials::{AuthMode, CredentialsConfig};

fn pack(day: u32, count: u32) -> u64 {
    ((day as u64) << 32) | count as u64
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// 单个调用方凭据
#[derive(Debug)]
pub struct CredentialEntry {
    key: String,
    owner_id: String,
    daily_limit: u32,
    active: bool,
    usage: AtomicU64,
    total_requests: AtomicU64,
}

impl CredentialEntry {
    pub fn new(key: impl Into<String>, owner_id: impl Into<String>, daily_limit: u32, active: bool) -> Self {
        Self {
            key: key.into(),
            owner_id: owner_id.into(),
            daily_limit,
            active,
            usage: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// 某天已使用的请求数（记录的日期不是当天时视为 0）
    pub fn used_on(&self, day: u32) -> u32 {
        let (recorded_day, count) = unpack(self.usage.load(Ordering::Acquire));
        if recorded_day == day { count } else { 0 }
    }

    /// 尝试占用一个配额
    ///
    /// 成功返回占用后的已用数，配额已满返回当前已用数
    pub fn try_acquire(&self, day: u32) -> Result<u32, u32> {
        let mut current = self.usage.load(Ordering::Acquire);
        loop {
            let (recorded_day, count) = unpack(current);
            let used = if recorded_day == day { count } else { 0 };
            if used >= self.daily_limit {
                return Err(used);
            }
            match self.usage.compare_exchange_weak(
                current,
                pack(day, used + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.total_requests.fetch_add(1, Ordering::Relaxed);
                    return Ok(used + 1);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// 退还一个配额（只在仍是同一天时生效）
    pub fn release(&self, day: u32) {
        let _ = self
            .usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let (recorded_day, count) = unpack(current);
                (recorded_day == day && count > 0).then(|| pack(day, count - 1))
            });
    }

    /// 如果记录的日期早于 `day`，把计数清零
    pub fn reset_if_stale(&self, day: u32) -> bool {
        self.usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let (recorded_day, _) = unpack(current);
                (recorded_day < day).then(|| pack(day, 0))
            })
            .is_ok()
    }
}

/// 配额日期计算（按配置的 UTC 偏移划分自然日）
#[derive(Debug, Clone, Copy)]
pub struct QuotaClock {
    offset: FixedOffset,
}

impl QuotaClock {
    pub fn new(offset_minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    pub fn day_index(&self, now: DateTime<Utc>) -> u32 {
        now.with_timezone(&self.offset).date_naive().num_days_from_ce().max(0) as u32
    }

    /// 下一个重置时刻（本地时间的下一个零点）
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_date = now.with_timezone(&self.offset).date_naive();
        local_date
            .succ_opt()
            .map(|d| d.and_time(NaiveTime::MIN))
            .and_then(|midnight| self.offset.from_local_datetime(&midnight).single())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| now + chrono::Duration::days(1))
    }
}

/// 凭据的当日用量视图
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialUsage {
    pub owner_id: String,
    pub requests_today: u32,
    pub daily_limit: u32,
    pub remaining: u32,
    pub reset_at: String,
    pub total_requests: u64,
    pub active: bool,
}

/// 一次已通过准入的请求占用的配额
///
/// 必须以 settle 结束；未 settle 就被丢弃时按失败处理
#[derive(Debug)]
pub struct Admission {
    credential: Arc<CredentialEntry>,
    day: u32,
    policy: QuotaPolicy,
    remaining: u32,
    reset_at: DateTime<Utc>,
    settled: bool,
}

impl Admission {
    pub fn owner_id(&self) -> &str {
        self.credential.owner_id()
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        self.reset_at
    }

    /// 请求结束时调用；success 策略下失败的请求会退还配额
    pub fn settle(&mut self, success: bool) {
        if self.settled {
            return;
        }
        self.settled = true;
        if !success && self.policy == QuotaPolicy::Success {
            self.credential.release(self.day);
            self.remaining = self.remaining.saturating_add(1);
            tracing::debug!(owner_id = %self.credential.owner_id(), "请求未成功，已退还配额");
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.settle(false);
    }
}

/// 认证与配额管理器
pub struct AuthManager {
    mode: AuthMode,
    policy: QuotaPolicy,
    clock: QuotaClock,
    credentials: Vec<Arc<CredentialEntry>>,
}

impl AuthManager {
    pub fn new(
        mode: AuthMode,
        policy: QuotaPolicy,
        clock: QuotaClock,
        credentials: Vec<CredentialEntry>,
    ) -> Self {
        Self {
            mode,
            policy,
            clock,
            credentials: credentials.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn from_config(credentials: &CredentialsConfig, quota: &QuotaConfig) -> Self {
        let entries = match credentials.mode {
            AuthMode::Shared => credentials
                .shared_key
                .iter()
                .map(|key| CredentialEntry::new(key.clone(), "shared", credentials.shared_daily_limit, true))
                .collect(),
            AuthMode::MultiUser => credentials
                .users
                .iter()
                .map(|u| CredentialEntry::new(u.key.clone(), u.owner_id.clone(), u.daily_limit, u.active))
                .collect(),
        };
        Self::new(
            credentials.mode,
            quota.policy,
            QuotaClock::new(quota.timezone_offset_minutes),
            entries,
        )
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }

    pub fn credentials(&self) -> &[Arc<CredentialEntry>] {
        &self.credentials
    }

    /// 识别调用方
    ///
    /// 遍历所有凭据做常量时间比较，匹配位置不影响耗时
    pub fn authenticate(&self, presented: Option<&str>) -> Result<Arc<CredentialEntry>, RouterError> {
        let key = match presented {
            Some(key) if !key.is_empty() => key,
            _ => return Err(RouterError::Unauthenticated),
        };

        let mut matched = None;
        for credential in &self.credentials {
            if constant_time_eq(key, &credential.key) && matched.is_none() {
                matched = Some(credential.clone());
            }
        }

        let Some(credential) = matched else {
            tracing::warn!(key = %mask_secret(key), "无效的 API 密钥");
            return Err(RouterError::InvalidCredential);
        };

        if !credential.active {
            tracing::warn!(owner_id = %credential.owner_id, "账户已停用");
            return Err(RouterError::AccountInactive {
                owner_id: credential.owner_id.clone(),
            });
        }

        Ok(credential)
    }

    /// 配额准入：通过时已原子地计入一次请求
    pub fn admit(&self, credential: &Arc<CredentialEntry>) -> Result<Admission, RouterError> {
        self.admit_at(credential, Utc::now())
    }

    pub fn admit_at(
        &self,
        credential: &Arc<CredentialEntry>,
        now: DateTime<Utc>,
    ) -> Result<Admission, RouterError> {
        let day = self.clock.day_index(now);
        let reset_at = self.clock.next_reset(now);

        match credential.try_acquire(day) {
            Ok(used) => Ok(Admission {
                credential: credential.clone(),
                day,
                policy: self.policy,
                remaining: credential.daily_limit.saturating_sub(used),
                reset_at,
                settled: false,
            }),
            Err(used) => {
                tracing::warn!(
                    owner_id = %credential.owner_id,
                    used,
                    daily_limit = credential.daily_limit,
                    "已达到每日请求上限"
                );
                Err(RouterError::QuotaExceeded {
                    owner_id: credential.owner_id.clone(),
                    daily_limit: credential.daily_limit,
                    reset_at,
                })
            }
        }
    }

    pub fn usage(&self, credential: &CredentialEntry) -> CredentialUsage {
        self.usage_at(credential, Utc::now())
    }

    fn usage_at(&self, credential: &CredentialEntry, now: DateTime<Utc>) -> CredentialUsage {
        let used = credential.used_on(self.clock.day_index(now));
        CredentialUsage {
            owner_id: credential.owner_id.clone(),
            requests_today: used,
            daily_limit: credential.daily_limit,
            remaining: credential.daily_limit.saturating_sub(used),
            reset_at: self.clock.next_reset(now).to_rfc3339(),
            total_requests: credential.total_requests(),
            active: credential.active,
        }
    }

    /// 清零所有跨天的计数，返回被重置的凭据数
    pub fn rollover_at(&self, now: DateTime<Utc>) -> usize {
        let day = self.clock.day_index(now);
        self.credentials
            .iter()
            .filter(|c| c.reset_if_stale(day))
            .count()
    }

    /// 启动每日重置任务，在每个重置时刻唤醒
    pub fn spawn_rollover(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = self.clock.next_reset(now);
                let wait = (next - now).to_std().unwrap_or(Duration::from_secs(1));
                tokio::time::sleep(wait).await;

                let reset = self.rollover_at(Utc::now());
                tracing::info!(credentials = reset, "每日配额已重置");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(policy: QuotaPolicy, users: Vec<CredentialEntry>) -> AuthManager {
        AuthManager::new(AuthMode::MultiUser, policy, QuotaClock::new(0), users)
    }

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_authenticate_outcomes() {
        let auth = manager(
            QuotaPolicy::Attempt,
            vec![
                CredentialEntry::new("sk-alice", "alice", 10, true),
                CredentialEntry::new("sk-bob", "bob", 10, false),
            ],
        );

        assert!(matches!(auth.authenticate(None), Err(RouterError::Unauthenticated)));
        assert!(matches!(auth.authenticate(Some("")), Err(RouterError::Unauthenticated)));
        assert!(matches!(
            auth.authenticate(Some("sk-mallory")),
            Err(RouterError::InvalidCredential)
        ));
        assert!(matches!(
            auth.authenticate(Some("sk-bob")),
            Err(RouterError::AccountInactive { .. })
        ));
        assert_eq!(auth.authenticate(Some("sk-alice")).unwrap().owner_id(), "alice");
    }

    #[test]
    fn test_limit_two_third_rejected() {
        let auth = manager(QuotaPolicy::Attempt, vec![CredentialEntry::new("K1", "k1", 2, true)]);
        let cred = auth.authenticate(Some("K1")).unwrap();
        let now = at("2026-10-18T08:00:00Z");

        let mut first = auth.admit_at(&cred, now).unwrap();
        assert_eq!(first.remaining(), 1);
        first.settle(true);
        let mut second = auth.admit_at(&cred, now).unwrap();
        assert_eq!(second.remaining(), 0);
        second.settle(false);

        match auth.admit_at(&cred, now) {
            Err(RouterError::QuotaExceeded { daily_limit, reset_at, .. }) => {
                assert_eq!(daily_limit, 2);
                assert_eq!(reset_at, at("2026-10-19T00:00:00Z"));
            }
            other => panic!("expected quota exceeded, got {:?}", other.map(|a| a.remaining())),
        }
        // attempt 策略下失败请求也计数
        assert_eq!(auth.usage_at(&cred, now).requests_today, 2);
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let auth = Arc::new(manager(
            QuotaPolicy::Attempt,
            vec![CredentialEntry::new("K", "k", 50, true)],
        ));
        let cred = auth.authenticate(Some("K")).unwrap();
        let now = Utc::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let auth = auth.clone();
                let cred = cred.clone();
                std::thread::spawn(move || {
                    let mut admitted = 0;
                    for _ in 0..20 {
                        if let Ok(mut admission) = auth.admit_at(&cred, now) {
                            admission.settle(true);
                            admitted += 1;
                        }
                    }
                    admitted
                })
            })
            .collect();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(cred.used_on(auth.clock.day_index(now)), 50);
    }

    #[test]
    fn test_success_policy_refunds_failures() {
        let auth = manager(QuotaPolicy::Success, vec![CredentialEntry::new("K", "k", 1, true)]);
        let cred = auth.authenticate(Some("K")).unwrap();
        let now = Utc::now();

        let mut admission = auth.admit_at(&cred, now).unwrap();
        admission.settle(false);
        assert_eq!(admission.remaining(), 1);

        // 被丢弃的准入同样退还
        let admission = auth.admit_at(&cred, now).unwrap();
        drop(admission);

        let mut admission = auth.admit_at(&cred, now).unwrap();
        admission.settle(true);
        assert!(auth.admit_at(&cred, now).is_err());
    }

    #[test]
    fn test_new_day_starts_from_zero() {
        let auth = manager(QuotaPolicy::Attempt, vec![CredentialEntry::new("K", "k", 1, true)]);
        let cred = auth.authenticate(Some("K")).unwrap();
        let day1 = at("2026-10-18T23:59:00Z");
        let day2 = at("2026-10-19T00:00:01Z");

        auth.admit_at(&cred, day1).unwrap().settle(true);
        assert!(auth.admit_at(&cred, day1).is_err());

        // 准入时把过期的日期视为 0
        assert!(auth.admit_at(&cred, day2).is_ok());
    }

    #[test]
    fn test_rollover_zeroes_stale_counters() {
        let auth = manager(
            QuotaPolicy::Attempt,
            vec![
                CredentialEntry::new("A", "a", 5, true),
                CredentialEntry::new("B", "b", 5, true),
            ],
        );
        let a = auth.authenticate(Some("A")).unwrap();
        let day1 = at("2026-10-18T12:00:00Z");
        auth.admit_at(&a, day1).unwrap().settle(true);
        auth.admit_at(&a, day1).unwrap().settle(true);

        let day2 = at("2026-10-19T00:00:00Z");
        assert_eq!(auth.rollover_at(day2), 2);
        assert_eq!(auth.usage_at(&a, day2).requests_today, 0);
        assert_eq!(auth.usage_at(&a, day2).total_requests, 2);
        // 同一天再次执行不会重复重置
        assert_eq!(auth.rollover_at(day2), 0);
    }

    #[test]
    fn test_clock_respects_offset() {
        // 东八区：UTC 16:00 已经是次日零点
        let clock = QuotaClock::new(480);
        let before = at("2026-10-18T15:59:59Z");
        let after = at("2026-10-18T16:00:00Z");
        assert_eq!(clock.day_index(before) + 1, clock.day_index(after));
        assert_eq!(clock.next_reset(before), after);
    }

    #[test]
    fn test_shared_mode_from_config() {
        let creds: CredentialsConfig =
            serde_json::from_str(r#"{"mode": "shared", "sharedKey": "sk-team"}"#).unwrap();
        let auth = AuthManager::from_config(&creds, &QuotaConfig::default());
        let cred = auth.authenticate(Some("sk-team")).unwrap();
        assert_eq!(cred.owner_id(), "shared");
        assert_eq!(cred.daily_limit(), 999_999);
    }
}
