pub mod error;
pub mod identity;
pub mod middleware;
pub mod quota;
pub mod storage;
pub mod sweeper;

use std::time::{Duration, Instant};

use error::QuotaError;

//ceilings for one identity class inside a rolling window
#[derive(Clone, Debug)]
pub struct QuotaPolicy {
    //max admitted uploads per window
    pub max_requests: u32,
    //max cumulative upload bytes per window
    pub max_bytes: u64,
    //window length
    pub window: Duration,
}

impl QuotaPolicy {
    pub fn new(max_requests: u32, max_bytes: u64, window: Duration) -> Self {
        Self {
            max_requests,
            max_bytes,
            window,
        }
    }

    fn validate(&self, class: &str) -> Result<(), QuotaError> {
        if self.window.is_zero() {
            return Err(QuotaError::InvalidPolicy(format!(
                "{class}: window must be non-zero"
            )));
        }
        if self.max_requests == 0 {
            return Err(QuotaError::InvalidPolicy(format!(
                "{class}: max_requests must be non-zero"
            )));
        }
        if self.max_bytes == 0 {
            return Err(QuotaError::InvalidPolicy(format!(
                "{class}: max_bytes must be non-zero"
            )));
        }
        Ok(())
    }
}

/// Policies for the two identity classes, plus an optional short-window
/// burst ceiling applied to every class on top of its own policy.
#[derive(Clone, Debug)]
pub struct PolicySet {
    pub guest: QuotaPolicy,
    pub member: QuotaPolicy,
    pub burst: Option<QuotaPolicy>,
}

impl PolicySet {
    pub fn new(guest: QuotaPolicy, member: QuotaPolicy) -> Result<Self, QuotaError> {
        guest.validate("guest")?;
        member.validate("member")?;
        Ok(Self {
            guest,
            member,
            burst: None,
        })
    }

    pub fn with_burst(mut self, burst: QuotaPolicy) -> Result<Self, QuotaError> {
        burst.validate("burst")?;
        self.burst = Some(burst);
        Ok(self)
    }

    // pure two-way lookup, no error path
    pub fn for_identity(&self, authenticated: bool) -> &QuotaPolicy {
        if authenticated {
            &self.member
        } else {
            &self.guest
        }
    }

    /// Staleness horizon for the sweeper. The store serves every class, so
    /// this must be the longest window across all configured policies, not
    /// any single class's window.
    pub fn sweep_horizon(&self) -> Duration {
        let mut horizon = self.guest.window.max(self.member.window);
        if let Some(burst) = &self.burst {
            horizon = horizon.max(burst.window);
        }
        horizon
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            // anonymous uploads tracked per origin address
            guest: QuotaPolicy::new(10, 100 * 1024 * 1024, Duration::from_secs(3600)),
            // signed-in accounts get more headroom
            member: QuotaPolicy::new(100, 1024 * 1024 * 1024, Duration::from_secs(3600)),
            burst: None,
        }
    }
}

/// Why an upload was turned away
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    TooManyRequests,
    TooManyBytes,
}

impl RejectReason {
    // stable machine-readable code for HTTP bodies and logs
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::TooManyRequests => "rate_limit_requests",
            RejectReason::TooManyBytes => "rate_limit_bytes",
        }
    }
}

/// Successful admission: the upload was charged against the window
#[derive(Clone, Copy, Debug)]
pub struct Admission {
    // uploads left in the window after this one
    pub remaining_requests: u32,
    // bytes left in the window after this upload
    pub remaining_bytes: u64,
    // when the current window ends
    pub window_ends_at: Instant,
    // stamp of the window the charge landed in, for scoped release
    pub generation: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct Rejection {
    pub reason: RejectReason,
    // time until the window rolls over
    pub retry_after: Duration,
    pub used_requests: u32,
    pub max_requests: u32,
    pub used_bytes: u64,
    pub max_bytes: u64,
}

/// Outcome of a quota check. Always returned, never an error: ceilings being
/// hit is an expected condition, not a failure.
#[derive(Clone, Copy, Debug)]
pub enum UploadDecision {
    Admitted(Admission),
    Rejected(Rejection),
}

impl UploadDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, UploadDecision::Admitted(_))
    }
}

/// Read-only view of one key's current usage
#[derive(Clone, Copy, Debug)]
pub struct UsageSnapshot {
    pub used_requests: u32,
    pub remaining_requests: u32,
    pub used_bytes: u64,
    pub remaining_bytes: u64,
    pub window_ends_at: Instant,
    // share of the byte ceiling consumed, 0.0..=100.0 in the normal case
    pub percent_used: f64,
}

//core trait the HTTP layer talks to
#[async_trait::async_trait]
pub trait UploadGate: Send + Sync {
    //gate a prospective upload of `bytes` and charge it if admitted
    async fn check_and_consume(
        &self,
        key: &str,
        bytes: u64,
        authenticated: bool,
    ) -> UploadDecision;

    //current usage without consuming anything
    async fn peek_status(&self, key: &str, authenticated: bool) -> UsageSnapshot;

    //hand quota back after a previously admitted upload is deleted
    async fn release(&self, key: &str, bytes: u64);
}

//re-export main types
pub use identity::client_key;
pub use quota::FixedWindowQuota;
pub use storage::MemoryStorage;
pub use storage::UsageEntry;
pub use sweeper::SweeperHandle;

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_requests: u32, max_bytes: u64, secs: u64) -> QuotaPolicy {
        QuotaPolicy::new(max_requests, max_bytes, Duration::from_secs(secs))
    }

    #[test]
    fn policy_set_rejects_zero_window() {
        let err = PolicySet::new(
            QuotaPolicy::new(10, 1000, Duration::ZERO),
            policy(10, 1000, 60),
        )
        .unwrap_err();
        assert!(err.to_string().contains("guest"));
    }

    #[test]
    fn policy_set_rejects_zero_ceilings() {
        assert!(PolicySet::new(policy(0, 1000, 60), policy(10, 1000, 60)).is_err());
        assert!(PolicySet::new(policy(10, 1000, 60), policy(10, 0, 60)).is_err());
    }

    #[test]
    fn burst_policy_is_validated_too() {
        let set = PolicySet::new(policy(10, 1000, 60), policy(20, 2000, 60)).unwrap();
        assert!(set.with_burst(policy(0, 1000, 1)).is_err());
    }

    #[test]
    fn identity_class_selects_policy() {
        let set = PolicySet::new(policy(1, 100, 60), policy(2, 200, 60)).unwrap();
        assert_eq!(set.for_identity(false).max_requests, 1);
        assert_eq!(set.for_identity(true).max_requests, 2);
    }

    #[test]
    fn sweep_horizon_is_the_longest_window() {
        let set = PolicySet::new(policy(1, 100, 30), policy(2, 200, 120)).unwrap();
        assert_eq!(set.sweep_horizon(), Duration::from_secs(120));

        let set = set.with_burst(policy(5, 500, 600)).unwrap();
        assert_eq!(set.sweep_horizon(), Duration::from_secs(600));
    }
}
