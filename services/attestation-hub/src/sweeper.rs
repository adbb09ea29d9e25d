//! Trust Expiry Sweeper
//!
//! Retires hosts whose verified assertion has passed its notOnOrAfter
//! instant. Hosts whose stored assertion no longer verifies are left alone.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::RegistryError;
use crate::model::{DeleteReason, RecordState, SYSTEM_ACTOR};
use crate::registry::{Registry, RegistryView};
use crate::verifier::AssertionVerifier;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub checked: usize,
    pub expired: usize,
    pub unverifiable: usize,
}

pub struct TrustExpirySweeper {
    registry: Arc<Registry>,
    verifier: Arc<dyn AssertionVerifier>,
}

impl TrustExpirySweeper {
    pub fn new(registry: Arc<Registry>, verifier: Arc<dyn AssertionVerifier>) -> Self {
        Self { registry, verifier }
    }

    pub fn sweep(&self) -> Result<SweepSummary, RegistryError> {
        self.sweep_at(Utc::now())
    }

    /// Sweep as of `now`. Assertions are checked outside the registry lock
    /// and every expiry lands in a single commit.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepSummary, RegistryError> {
        let mut summary = SweepSummary::default();
        let candidates = self.registry.read(|t| t.active_hosts());

        let mut expired = Vec::new();
        for host in candidates {
            let Some(assertion) = host.assertion else {
                continue;
            };
            summary.checked += 1;

            match self.verifier.verify(&assertion) {
                Ok(v) if v.is_expired_at(now) => expired.push((host.id, assertion, v.not_after)),
                Ok(_) => {}
                Err(e) => {
                    warn!(host_id = %host.id, error = %e, "Stored assertion no longer verifies, leaving host untouched");
                    summary.unverifiable += 1;
                }
            }
        }

        if !expired.is_empty() {
            let retired = self.registry.transaction(|txn| {
                let mut retired = Vec::new();
                for (host_id, assertion, not_after) in &expired {
                    let result = txn.savepoint(|txn| {
                        // re-read so a concurrent refresh of this host wins
                        let Some(mut current) = txn.host(host_id) else {
                            return Ok(false);
                        };
                        if !current.is_active() || current.assertion.as_deref() != Some(assertion.as_str()) {
                            return Ok(false);
                        }
                        current.state = RecordState::deleted(DeleteReason::Expired, now);
                        current.audit.touch(SYSTEM_ACTOR, now);
                        txn.put_host(current)?;
                        Ok(true)
                    });
                    match result {
                        Ok(true) => retired.push((host_id.as_str(), *not_after)),
                        Ok(false) => {}
                        Err(e) if e.is_conflict() => {
                            warn!(host_id = %host_id, error = %e, "Expiry write conflicted, retrying next cycle");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(retired)
            })?;

            for (host_id, not_after) in &retired {
                info!(host_id = %host_id, not_after = %not_after, "Host trust expired, soft-deleted");
            }
            summary.expired = retired.len();
        }

        info!(
            checked = summary.checked,
            expired = summary.expired,
            unverifiable = summary.unverifiable,
            "Expiry sweep complete"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, AUTHORITY_PUBLIC_KEY};
    use crate::verifier::JwsAssertionVerifier;
    use chrono::Duration;

    fn setup(hosts: Vec<crate::model::Host>) -> (Arc<Registry>, TrustExpirySweeper) {
        let registry = Arc::new(Registry::in_memory());
        registry
            .transaction(|txn| {
                for host in hosts {
                    txn.put_host(host)?;
                }
                Ok(())
            })
            .unwrap();
        let verifier = JwsAssertionVerifier::from_rsa_pem(AUTHORITY_PUBLIC_KEY.as_bytes()).unwrap();
        let sweeper = TrustExpirySweeper::new(registry.clone(), Arc::new(verifier));
        (registry, sweeper)
    }

    fn attested(id: &str, hw: &str, issued: DateTime<Utc>, not_after: DateTime<Utc>) -> crate::model::Host {
        let mut host = testing::host(id, hw);
        host.assertion = Some(testing::sign_assertion(&testing::assertion_claims(
            id,
            issued,
            not_after,
            &[("bios", true)],
        )));
        host
    }

    #[test]
    fn test_expired_host_is_soft_deleted() {
        let now = Utc::now();
        let (registry, sweeper) = setup(vec![
            attested("h-expired", "A", now - Duration::hours(48), now - Duration::hours(24)),
            attested("h-fresh", "B", now - Duration::hours(1), now + Duration::hours(23)),
        ]);

        let summary = sweeper.sweep_at(now).unwrap();

        assert_eq!(summary.checked, 2);
        assert_eq!(summary.expired, 1);
        registry.read(|t| {
            let expired = t.host("h-expired").unwrap();
            assert!(matches!(
                expired.state,
                RecordState::Deleted { reason: DeleteReason::Expired, .. }
            ));
            assert!(t.host("h-fresh").unwrap().is_active());
        });
    }

    #[test]
    fn test_expiries_share_one_commit() {
        let now = Utc::now();
        let (registry, sweeper) = setup(vec![
            attested("h-1", "A", now - Duration::hours(48), now - Duration::hours(24)),
            attested("h-2", "B", now - Duration::hours(30), now - Duration::hours(6)),
            attested("h-3", "C", now - Duration::hours(1), now + Duration::hours(23)),
        ]);
        let before = registry.generation();

        let summary = sweeper.sweep_at(now).unwrap();

        assert_eq!(summary.expired, 2);
        assert_eq!(registry.generation(), before + 1);
        assert_eq!(registry.read(|t| t.active_hosts().len()), 1);
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let now = Utc::now();
        let not_after = DateTime::from_timestamp(now.timestamp(), 0).unwrap();
        let (registry, sweeper) = setup(vec![attested("h-1", "A", not_after - Duration::hours(1), not_after)]);

        assert_eq!(sweeper.sweep_at(not_after - Duration::seconds(1)).unwrap().expired, 0);
        assert_eq!(sweeper.sweep_at(not_after).unwrap().expired, 1);
        assert!(!registry.read(|t| t.host("h-1")).unwrap().is_active());
    }

    #[test]
    fn test_unverifiable_assertion_leaves_host() {
        let mut host = testing::host("h-1", "A");
        host.assertion = Some("tampered".to_string());
        let (registry, sweeper) = setup(vec![host, testing::host("h-2", "B")]);

        let summary = sweeper.sweep().unwrap();

        assert_eq!(summary.checked, 1);
        assert_eq!(summary.unverifiable, 1);
        assert_eq!(registry.read(|t| t.active_hosts().len()), 2);
    }
}
