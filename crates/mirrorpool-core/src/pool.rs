//! Primary account pool
//!
//! Tracks the primary-storage accounts, their quota and health, and hands out
//! one account per upload. Account counters change only through
//! [`AccountPool::select_account`], the [`AccountLease`] it returns, and the
//! health entry points (`record_probe`, `record_failure`).

use crate::metrics::ServiceMetrics;
use chrono::Utc;
use mirrorpool_common::config::PoolConfig;
use mirrorpool_common::{
    AccountEndpoint, AccountId, AccountRecord, Error, HealthState, PoolExhaustion, Result,
};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

struct AccountEntry {
    record: AccountRecord,
    endpoint: AccountEndpoint,
    /// Quota held by in-flight uploads, not yet in `quota_used_bytes`
    reserved_bytes: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl AccountEntry {
    const fn available_quota(&self) -> u64 {
        self.record
            .remaining_quota()
            .saturating_sub(self.reserved_bytes)
    }
}

/// Pool of primary-storage accounts
pub struct AccountPool {
    accounts: Mutex<BTreeMap<AccountId, AccountEntry>>,
    max_sessions_per_account: u32,
    failure_threshold: u32,
    recovery_threshold: u32,
    metrics: Arc<ServiceMetrics>,
}

impl AccountPool {
    /// Build the pool from configuration; every account starts healthy
    pub fn new(config: &PoolConfig, metrics: Arc<ServiceMetrics>) -> Result<Self> {
        let mut accounts = BTreeMap::new();
        for account in &config.accounts {
            let account_id = AccountId::new(account.id.as_str())?;
            let entry = AccountEntry {
                record: AccountRecord::new(account_id.clone(), account.quota_bytes),
                endpoint: AccountEndpoint {
                    account_id: account_id.clone(),
                    endpoint: account.endpoint.clone(),
                    secret: account.secret.clone(),
                },
                reserved_bytes: 0,
                consecutive_failures: 0,
                consecutive_successes: 0,
            };
            if accounts.insert(account_id, entry).is_some() {
                return Err(Error::Configuration(format!(
                    "duplicate account id: {}",
                    account.id
                )));
            }
        }

        info!("Account pool initialized with {} accounts", accounts.len());
        Ok(Self {
            accounts: Mutex::new(accounts),
            max_sessions_per_account: config.max_sessions_per_account,
            failure_threshold: config.failure_threshold,
            recovery_threshold: config.recovery_threshold,
            metrics,
        })
    }

    /// Seed `quota_used_bytes` from persisted usage figures
    pub fn restore_usage(&self, usage: &HashMap<AccountId, u64>) {
        let mut accounts = self.accounts.lock();
        for (account_id, used) in usage {
            match accounts.get_mut(account_id) {
                Some(entry) => entry.record.quota_used_bytes = *used,
                None => warn!("Ignoring usage for unknown account {}", account_id),
            }
        }
    }

    /// Pick an account with room for `required_bytes` and open a session on it
    ///
    /// Healthy accounts are preferred; degraded ones are used only when no
    /// healthy account is eligible. Unavailable accounts are never returned.
    /// Ties go to the account with the fewest sessions, then the lowest
    /// quota usage ratio.
    pub fn select_account(self: &Arc<Self>, required_bytes: u64) -> Result<AccountLease> {
        let mut accounts = self.accounts.lock();

        let chosen = match self.choose(&accounts, required_bytes) {
            Ok(account_id) => account_id,
            Err(reason) => {
                drop(accounts);
                debug!(
                    "No account for {} bytes: {}",
                    required_bytes,
                    reason.as_str()
                );
                self.metrics.record_pool_exhausted();
                return Err(Error::PoolExhausted(reason));
            }
        };

        let entry = accounts
            .get_mut(&chosen)
            .ok_or_else(|| Error::internal(format!("selected account {chosen} vanished")))?;
        entry.record.active_session_count += 1;
        entry.reserved_bytes += required_bytes;

        Ok(AccountLease {
            pool: Arc::clone(self),
            record: entry.record.clone(),
            endpoint: entry.endpoint.clone(),
            reserved_bytes: required_bytes,
        })
    }

    fn choose(
        &self,
        accounts: &BTreeMap<AccountId, AccountEntry>,
        required_bytes: u64,
    ) -> std::result::Result<AccountId, PoolExhaustion> {
        if accounts.is_empty() {
            return Err(PoolExhaustion::NoAccounts);
        }

        let reachable: Vec<&AccountEntry> = accounts
            .values()
            .filter(|entry| entry.record.health_state != HealthState::Unavailable)
            .collect();
        if reachable.is_empty() {
            return Err(PoolExhaustion::Unhealthy);
        }

        let with_quota: Vec<&AccountEntry> = reachable
            .into_iter()
            .filter(|entry| entry.available_quota() >= required_bytes)
            .collect();
        if with_quota.is_empty() {
            // Recovery of an unavailable account with room would help more than waiting for quota
            let blocked_by_health = accounts.values().any(|entry| {
                entry.record.health_state == HealthState::Unavailable
                    && entry.available_quota() >= required_bytes
            });
            return Err(if blocked_by_health {
                PoolExhaustion::Unhealthy
            } else {
                PoolExhaustion::Quota
            });
        }

        let open: Vec<&AccountEntry> = with_quota
            .into_iter()
            .filter(|entry| entry.record.active_session_count < self.max_sessions_per_account)
            .collect();
        if open.is_empty() {
            return Err(PoolExhaustion::Saturated);
        }

        let healthy: Vec<&AccountEntry> = open
            .iter()
            .copied()
            .filter(|entry| entry.record.health_state == HealthState::Healthy)
            .collect();
        let candidates = if healthy.is_empty() { open } else { healthy };

        candidates
            .into_iter()
            .min_by(|a, b| compare_load(&a.record, &b.record))
            .map(|entry| entry.record.account_id.clone())
            .ok_or(PoolExhaustion::NoAccounts)
    }

    /// Close one session on `account_id`; false if it had none open
    fn release_session(&self, account_id: &AccountId, unreturned_bytes: u64) -> bool {
        let mut accounts = self.accounts.lock();
        let Some(entry) = accounts.get_mut(account_id) else {
            error!("Release for unknown account {}", account_id);
            return false;
        };
        entry.reserved_bytes = entry.reserved_bytes.saturating_sub(unreturned_bytes);
        if entry.record.active_session_count == 0 {
            error!("Release on account {} with no open sessions", account_id);
            return false;
        }
        entry.record.active_session_count -= 1;
        true
    }

    /// Turn a reservation into recorded usage; returns the new used total
    fn commit_usage(&self, account_id: &AccountId, reserved_bytes: u64, used_bytes: u64) -> u64 {
        let mut accounts = self.accounts.lock();
        match accounts.get_mut(account_id) {
            Some(entry) => {
                entry.reserved_bytes = entry.reserved_bytes.saturating_sub(reserved_bytes);
                entry.record.quota_used_bytes =
                    entry.record.quota_used_bytes.saturating_add(used_bytes);
                entry.record.quota_used_bytes
            }
            None => {
                error!("Usage commit for unknown account {}", account_id);
                0
            }
        }
    }

    /// Feed the result of one health probe
    pub fn record_probe(&self, account_id: &AccountId, healthy: bool) {
        let mut accounts = self.accounts.lock();
        let Some(entry) = accounts.get_mut(account_id) else {
            return;
        };
        entry.record.last_checked_at = Some(Utc::now());
        if healthy {
            self.apply_success(entry);
        } else {
            self.apply_failure(entry);
        }
    }

    /// Report an operation failure against an account; counts like a failed probe
    pub fn record_failure(&self, account_id: &AccountId) {
        if let Some(entry) = self.accounts.lock().get_mut(account_id) {
            self.apply_failure(entry);
        }
    }

    fn apply_failure(&self, entry: &mut AccountEntry) {
        entry.consecutive_successes = 0;
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        let previous = entry.record.health_state;
        let next = if entry.consecutive_failures >= self.failure_threshold {
            HealthState::Unavailable
        } else if previous == HealthState::Healthy {
            HealthState::Degraded
        } else {
            previous
        };
        if next != previous {
            warn!(
                "Account {} {} -> {} after {} consecutive failures",
                entry.record.account_id, previous, next, entry.consecutive_failures
            );
            entry.record.health_state = next;
        }
    }

    fn apply_success(&self, entry: &mut AccountEntry) {
        entry.consecutive_failures = 0;
        entry.consecutive_successes = entry.consecutive_successes.saturating_add(1);

        let previous = entry.record.health_state;
        if previous != HealthState::Healthy
            && entry.consecutive_successes >= self.recovery_threshold
        {
            info!(
                "Account {} recovered: {} -> healthy",
                entry.record.account_id, previous
            );
            entry.record.health_state = HealthState::Healthy;
        }
    }

    pub fn health_state(&self, account_id: &AccountId) -> Option<HealthState> {
        self.accounts
            .lock()
            .get(account_id)
            .map(|entry| entry.record.health_state)
    }

    pub fn endpoint(&self, account_id: &AccountId) -> Option<AccountEndpoint> {
        self.accounts
            .lock()
            .get(account_id)
            .map(|entry| entry.endpoint.clone())
    }

    /// Endpoints of every account, for the health monitor
    pub fn endpoints(&self) -> Vec<AccountEndpoint> {
        self.accounts
            .lock()
            .values()
            .map(|entry| entry.endpoint.clone())
            .collect()
    }

    pub fn record(&self, account_id: &AccountId) -> Option<AccountRecord> {
        self.accounts
            .lock()
            .get(account_id)
            .map(|entry| entry.record.clone())
    }

    /// Current records, ordered by account id
    pub fn snapshot(&self) -> Vec<AccountRecord> {
        self.accounts
            .lock()
            .values()
            .map(|entry| entry.record.clone())
            .collect()
    }
}

fn compare_load(a: &AccountRecord, b: &AccountRecord) -> Ordering {
    a.active_session_count
        .cmp(&b.active_session_count)
        .then_with(|| a.usage_ratio().total_cmp(&b.usage_ratio()))
        .then_with(|| a.account_id.cmp(&b.account_id))
}

/// An open session on a pool account
///
/// Dropping the lease closes the session and returns any quota reservation
/// that was not committed.
pub struct AccountLease {
    pool: Arc<AccountPool>,
    /// Record as of selection
    record: AccountRecord,
    endpoint: AccountEndpoint,
    reserved_bytes: u64,
}

impl AccountLease {
    pub const fn account_id(&self) -> &AccountId {
        &self.record.account_id
    }

    pub const fn record(&self) -> &AccountRecord {
        &self.record
    }

    pub const fn endpoint(&self) -> &AccountEndpoint {
        &self.endpoint
    }

    /// Record `used_bytes` against the account's quota, consuming the reservation
    ///
    /// Returns the account's new used total for persistence.
    pub fn commit(&mut self, used_bytes: u64) -> u64 {
        let reserved = std::mem::take(&mut self.reserved_bytes);
        self.pool
            .commit_usage(&self.record.account_id, reserved, used_bytes)
    }

    pub fn record_failure(&self) {
        self.pool.record_failure(&self.record.account_id);
    }
}

impl std::fmt::Debug for AccountLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountLease")
            .field("account_id", &self.record.account_id)
            .field("reserved_bytes", &self.reserved_bytes)
            .finish_non_exhaustive()
    }
}

impl Drop for AccountLease {
    fn drop(&mut self) {
        self.pool
            .release_session(&self.record.account_id, self.reserved_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorpool_common::config::AccountConfig;

    fn account(id: &str, quota: u64) -> AccountConfig {
        AccountConfig {
            id: id.to_string(),
            endpoint: format!("memory://{id}"),
            secret: None,
            quota_bytes: quota,
        }
    }

    fn pool(accounts: Vec<AccountConfig>, max_sessions: u32) -> Arc<AccountPool> {
        let config = PoolConfig {
            accounts,
            max_sessions_per_account: max_sessions,
            ..PoolConfig::default()
        };
        Arc::new(AccountPool::new(&config, Arc::new(ServiceMetrics::new())).unwrap())
    }

    fn id(s: &str) -> AccountId {
        AccountId::new(s).unwrap()
    }

    fn fail(pool: &AccountPool, account: &str, times: usize) {
        for _ in 0..times {
            pool.record_probe(&id(account), false);
        }
    }

    #[test]
    fn test_health_hysteresis() {
        let pool = pool(vec![account("a", 100)], 4);

        fail(&pool, "a", 1);
        assert_eq!(pool.health_state(&id("a")), Some(HealthState::Degraded));
        fail(&pool, "a", 1);
        assert_eq!(pool.health_state(&id("a")), Some(HealthState::Degraded));
        fail(&pool, "a", 1);
        assert_eq!(pool.health_state(&id("a")), Some(HealthState::Unavailable));

        pool.record_probe(&id("a"), true);
        assert_eq!(pool.health_state(&id("a")), Some(HealthState::Healthy));
        assert!(pool.record(&id("a")).unwrap().last_checked_at.is_some());
    }

    #[test]
    fn test_interleaved_success_resets_failures() {
        let pool = pool(vec![account("a", 100)], 4);
        fail(&pool, "a", 2);
        pool.record_probe(&id("a"), true);
        fail(&pool, "a", 2);
        assert_eq!(pool.health_state(&id("a")), Some(HealthState::Degraded));
    }

    #[test]
    fn test_never_selects_unavailable() {
        let pool = pool(vec![account("a", 100), account("b", 100)], 16);
        fail(&pool, "a", 3);

        let leases: Vec<_> = (0..8).map(|_| pool.select_account(1).unwrap()).collect();
        assert!(leases.iter().all(|lease| lease.account_id() == &id("b")));
    }

    #[test]
    fn test_all_unavailable_is_distinct_from_quota() {
        let pool = pool(vec![account("a", 100), account("b", 100)], 16);
        fail(&pool, "a", 3);
        fail(&pool, "b", 3);
        assert!(matches!(
            pool.select_account(1),
            Err(Error::PoolExhausted(PoolExhaustion::Unhealthy))
        ));

        let small = pool_with_quota();
        assert!(matches!(
            small.select_account(1000),
            Err(Error::PoolExhausted(PoolExhaustion::Quota))
        ));
    }

    fn pool_with_quota() -> Arc<AccountPool> {
        pool(vec![account("a", 10), account("b", 20)], 16)
    }

    #[test]
    fn test_reservation_prevents_oversubscription() {
        let pool = pool(vec![account("a", 100)], 16);
        let first = pool.select_account(60).unwrap();
        assert!(matches!(
            pool.select_account(60),
            Err(Error::PoolExhausted(PoolExhaustion::Quota))
        ));
        drop(first);
        assert!(pool.select_account(60).is_ok());
    }

    #[test]
    fn test_commit_records_usage() {
        let pool = pool(vec![account("a", 100)], 16);
        let mut lease = pool.select_account(40).unwrap();
        assert_eq!(lease.commit(40), 40);
        drop(lease);

        let record = pool.record(&id("a")).unwrap();
        assert_eq!(record.quota_used_bytes, 40);
        assert_eq!(record.active_session_count, 0);
        assert!(pool.select_account(61).is_err());
        assert!(pool.select_account(60).is_ok());
    }

    #[test]
    fn test_tie_break_by_sessions_then_usage() {
        let pool = pool(vec![account("a", 100), account("b", 100)], 16);
        let mut usage = HashMap::new();
        usage.insert(id("a"), 50);
        pool.restore_usage(&usage);

        let first = pool.select_account(1).unwrap();
        assert_eq!(first.account_id(), &id("b"));
        let second = pool.select_account(1).unwrap();
        assert_eq!(second.account_id(), &id("a"));
    }

    #[test]
    fn test_degraded_used_only_as_fallback() {
        let pool = pool(vec![account("a", 100), account("b", 100)], 16);
        fail(&pool, "a", 1);

        let leases: Vec<_> = (0..4).map(|_| pool.select_account(1).unwrap()).collect();
        assert!(leases.iter().all(|lease| lease.account_id() == &id("b")));

        fail(&pool, "b", 3);
        assert_eq!(pool.select_account(1).unwrap().account_id(), &id("a"));
    }

    #[test]
    fn test_session_cap_and_counts() {
        let pool = pool(vec![account("a", 100)], 2);
        let first = pool.select_account(1).unwrap();
        let second = pool.select_account(1).unwrap();
        assert!(matches!(
            pool.select_account(1),
            Err(Error::PoolExhausted(PoolExhaustion::Saturated))
        ));
        assert_eq!(pool.record(&id("a")).unwrap().active_session_count, 2);

        drop(first);
        drop(second);
        assert_eq!(pool.record(&id("a")).unwrap().active_session_count, 0);
        assert!(!pool.release_session(&id("a"), 0));
        assert_eq!(pool.record(&id("a")).unwrap().active_session_count, 0);
    }

    #[test]
    fn test_empty_pool() {
        let pool = pool(Vec::new(), 2);
        assert!(matches!(
            pool.select_account(1),
            Err(Error::PoolExhausted(PoolExhaustion::NoAccounts))
        ));
    }

    #[test]
    fn test_concurrent_select_respects_cap() {
        let pool = pool(vec![account("a", 1_000_000), account("b", 1_000_000)], 3);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if let Ok(lease) = pool.select_account(1) {
                            let count = pool
                                .record(lease.account_id())
                                .unwrap()
                                .active_session_count;
                            assert!(count <= 3);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for record in pool.snapshot() {
            assert_eq!(record.active_session_count, 0);
        }
    }
}
