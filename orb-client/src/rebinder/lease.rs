//! 租约状态 - 下次续期时间与连续失败计数

use std::time::Duration;
use tokio::time::Instant;

/// Lease bookkeeping for one registered binding.
///
/// `next_renewal == None` means not currently leased (due now). The error
/// count resets on every successful bind or renewal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseState {
    next_renewal: Option<Instant>,
    error_count: u32,
}

impl LeaseState {
    pub fn next_renewal(&self) -> Option<Instant> {
        self.next_renewal
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn is_bound(&self) -> bool {
        self.next_renewal.is_some()
    }

    /// Bound and the lease is due for renewal
    pub fn needs_refresh(&self, now: Instant) -> bool {
        matches!(self.next_renewal, Some(at) if now >= at)
    }

    /// Either unbound or due for renewal
    pub fn needs_work(&self, now: Instant) -> bool {
        self.next_renewal.is_none_or(|at| now >= at)
    }

    /// Successful bind or renewal
    pub fn set_next_renewal(&mut self, now: Instant, threshold: Duration) {
        self.next_renewal = Some(now + threshold);
        self.error_count = 0;
    }

    pub fn set_not_bound(&mut self) {
        self.next_renewal = None;
    }

    /// Returns the new count
    pub fn inc_error_count(&mut self) -> u32 {
        self.error_count = self.error_count.saturating_add(1);
        self.error_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbound_needs_work_not_refresh() {
        let lease = LeaseState::default();
        let now = Instant::now();
        assert!(!lease.is_bound());
        assert!(lease.needs_work(now));
        assert!(!lease.needs_refresh(now));
    }

    #[test]
    fn test_bound_lease_due_only_after_threshold() {
        let mut lease = LeaseState::default();
        let now = Instant::now();
        lease.set_next_renewal(now, Duration::from_secs(60));

        assert!(lease.is_bound());
        assert!(!lease.needs_work(now + Duration::from_secs(59)));
        assert!(lease.needs_refresh(now + Duration::from_secs(60)));
        assert_eq!(lease.next_renewal(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_success_resets_errors() {
        let mut lease = LeaseState::default();
        assert_eq!(lease.inc_error_count(), 1);
        assert_eq!(lease.inc_error_count(), 2);
        lease.set_next_renewal(Instant::now(), Duration::from_secs(1));
        assert_eq!(lease.error_count(), 0);

        // 取消绑定不影响错误计数
        lease.inc_error_count();
        lease.set_not_bound();
        assert_eq!(lease.error_count(), 1);
    }
}
