use crate::storage::MemoryStorage;
use crate::{
    Admission, PolicySet, QuotaPolicy, RejectReason, Rejection, UploadDecision, UploadGate,
    UsageSnapshot,
};
use std::time::Instant;

/// Fixed-window dual-limit quota gate.
///
/// Tracks admitted upload count and byte volume per key against the policy
/// for the key's identity class. Stale windows reset lazily on access; the
/// sweeper evicts abandoned entries separately and is not needed for
/// correctness.
pub struct FixedWindowQuota {
    storage: MemoryStorage,
    policies: PolicySet,
}

impl FixedWindowQuota {
    pub fn new(policies: PolicySet) -> Self {
        Self {
            storage: MemoryStorage::new(),
            policies,
        }
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    //the read-modify-write at the heart of admission: runs entirely under
    //the store's per-key lock
    fn consume(&self, key: &str, bytes: u64, policy: &QuotaPolicy) -> UploadDecision {
        self.storage
            .with_current_entry(key, policy.window, |entry, now| {
                let window_ends_at = entry.window_start + policy.window;
                // the request-count ceiling is checked before the byte
                // ceiling; a request violating both reports as count
                if entry.count >= policy.max_requests {
                    return UploadDecision::Rejected(Rejection {
                        reason: RejectReason::TooManyRequests,
                        retry_after: window_ends_at.saturating_duration_since(now),
                        used_requests: entry.count,
                        max_requests: policy.max_requests,
                        used_bytes: entry.total_bytes,
                        max_bytes: policy.max_bytes,
                    });
                }
                if entry.total_bytes.saturating_add(bytes) > policy.max_bytes {
                    return UploadDecision::Rejected(Rejection {
                        reason: RejectReason::TooManyBytes,
                        retry_after: window_ends_at.saturating_duration_since(now),
                        used_requests: entry.count,
                        max_requests: policy.max_requests,
                        used_bytes: entry.total_bytes,
                        max_bytes: policy.max_bytes,
                    });
                }
                entry.count += 1;
                entry.total_bytes += bytes;
                UploadDecision::Admitted(Admission {
                    remaining_requests: policy.max_requests - entry.count,
                    remaining_bytes: policy.max_bytes - entry.total_bytes,
                    window_ends_at,
                    generation: entry.generation,
                })
            })
    }

    //compensating subtraction, floored at zero on both counters. Absent
    //keys are left absent: duplicate or out-of-order deletions are expected
    fn release_charge(&self, key: &str, bytes: u64) {
        self.storage.with_existing_entry(key, |entry| {
            entry.count = entry.count.saturating_sub(1);
            entry.total_bytes = entry.total_bytes.saturating_sub(bytes);
        });
    }

    /// Like [`UploadGate::release`], but scoped to the window the admission
    /// was charged in. The plain release debits whatever entry currently
    /// sits at the key, which after a window rollover is a newer, unrelated
    /// window; this variant compares the admission's generation stamp and
    /// becomes a no-op once the stamp no longer matches.
    pub fn release_if_current(&self, key: &str, bytes: u64, generation: u64) {
        self.storage.with_existing_entry(key, |entry| {
            if entry.generation == generation {
                entry.count = entry.count.saturating_sub(1);
                entry.total_bytes = entry.total_bytes.saturating_sub(bytes);
            }
        });
    }
}

//key prefix keeping burst counters out of the per-class keyspace
fn burst_key(key: &str) -> String {
    format!("burst:{key}")
}

#[async_trait::async_trait]
impl UploadGate for FixedWindowQuota {
    async fn check_and_consume(
        &self,
        key: &str,
        bytes: u64,
        authenticated: bool,
    ) -> UploadDecision {
        let policy = self.policies.for_identity(authenticated);
        let Some(burst) = &self.policies.burst else {
            return self.consume(key, bytes, policy);
        };

        // burst gate first; its charge is handed back if the class policy
        // then rejects, so a rejected attempt consumes nothing overall
        let burst_key = burst_key(key);
        let burst_decision = self.consume(&burst_key, bytes, burst);
        if let UploadDecision::Rejected(_) = burst_decision {
            return burst_decision;
        }
        let decision = self.consume(key, bytes, policy);
        if let UploadDecision::Rejected(_) = decision {
            self.release_charge(&burst_key, bytes);
        }
        decision
    }

    async fn peek_status(&self, key: &str, authenticated: bool) -> UsageSnapshot {
        let policy = self.policies.for_identity(authenticated);
        let now = Instant::now();
        // absent or expired reads as a fresh window, without creating one
        let entry = self
            .storage
            .get(key)
            .filter(|entry| !entry.is_expired(now, policy.window));
        let (used_requests, used_bytes, window_start) = match entry {
            Some(entry) => (entry.count, entry.total_bytes, entry.window_start),
            None => (0, 0, now),
        };
        UsageSnapshot {
            used_requests,
            remaining_requests: policy.max_requests.saturating_sub(used_requests),
            used_bytes,
            remaining_bytes: policy.max_bytes.saturating_sub(used_bytes),
            window_ends_at: window_start + policy.window,
            percent_used: used_bytes as f64 / policy.max_bytes as f64 * 100.0,
        }
    }

    async fn release(&self, key: &str, bytes: u64) {
        self.release_charge(key, bytes);
    }
}
