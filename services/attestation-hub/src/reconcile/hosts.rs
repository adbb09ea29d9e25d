//! Host Registry Reconciler
//!
//! Merges pulled host/attestation pairs into the registry. Records are
//! keyed by registry id; a host that re-enrolls under a new registry id
//! supersedes every active record carrying the same hardware id.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::model::{
    normalize_hardware_id, Audit, DeleteReason, Host, RecordState, TrustState, SYSTEM_ACTOR,
};
use crate::registry::{Registry, RegistryView, Transaction};
use crate::source::SourceRecord;
use crate::verifier::{AssertionVerifier, VerifiedAssertion};

/// What an upsert did to the target record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertAction {
    Created,
    Updated,
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub host: Host,
    pub action: UpsertAction,
    /// Registry ids soft-deleted because they shared the hardware id
    pub superseded: Vec<String>,
}

/// Counts for one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub superseded: usize,
    pub unverified: usize,
    pub conflicts: usize,
}

pub struct HostRegistryReconciler {
    registry: Arc<Registry>,
    verifier: Arc<dyn AssertionVerifier>,
    tag_marker: String,
}

impl HostRegistryReconciler {
    pub fn new(
        registry: Arc<Registry>,
        verifier: Arc<dyn AssertionVerifier>,
        tag_marker: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            verifier,
            tag_marker: tag_marker.into(),
        }
    }

    pub fn with_tag_marker(mut self, marker: impl Into<String>) -> Self {
        self.set_tag_marker(marker);
        self
    }

    pub fn set_tag_marker(&mut self, marker: impl Into<String>) {
        self.tag_marker = marker.into();
    }

    /// Upsert one host from a pulled record and its verified assertion
    pub fn upsert(
        &self,
        record: &SourceRecord,
        verified: &VerifiedAssertion,
    ) -> Result<UpsertOutcome, RegistryError> {
        let now = Utc::now();
        self.registry
            .transaction(|txn| self.stage_upsert(txn, record, verified, now))
    }

    fn stage_upsert(
        &self,
        txn: &mut Transaction<'_>,
        record: &SourceRecord,
        verified: &VerifiedAssertion,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, RegistryError> {
        let descriptor = &record.host;
        let hardware_id = normalize_hardware_id(&descriptor.hardware_uuid);
        if descriptor.id.trim().is_empty() || hardware_id.is_empty() {
            return Err(RegistryError::Invalid(format!(
                "host record '{}' lacks an id or hardware id",
                descriptor.id
            )));
        }

        let mut superseded = Vec::new();
        for mut other in txn.hosts_with_hardware_id(&hardware_id) {
            if other.id == descriptor.id || !other.is_active() {
                continue;
            }
            other.state = RecordState::deleted(DeleteReason::Superseded, now);
            other.audit.touch(SYSTEM_ACTOR, now);
            superseded.push(other.id.clone());
            txn.put_host(other)?;
        }

        let (mut host, action) = match txn.host(&descriptor.id) {
            Some(existing) => (existing, UpsertAction::Updated),
            None => (
                Host {
                    id: descriptor.id.clone(),
                    hardware_id: hardware_id.clone(),
                    name: descriptor.host_name.clone(),
                    connection_url: None,
                    aik_certificate: None,
                    aik_sha1: None,
                    bios_mle_uuid: None,
                    trust: TrustState::default(),
                    tags: Default::default(),
                    trust_response: None,
                    assertion: None,
                    state: RecordState::Active,
                    audit: Audit::new(SYSTEM_ACTOR, now),
                    version: 0,
                },
                UpsertAction::Created,
            ),
        };

        host.hardware_id = hardware_id;
        host.name = descriptor.host_name.clone();
        host.connection_url = descriptor.connection_string.clone();
        host.aik_certificate = descriptor.aik_certificate.clone();
        host.aik_sha1 = descriptor.aik_sha1.clone();
        host.bios_mle_uuid = descriptor.bios_mle_uuid.clone();
        host.trust = TrustState {
            domains: verified.trust.clone(),
            trusted: verified.trusted,
            valid_to: Some(verified.not_after),
        };
        host.tags = verified.tags(&self.tag_marker);
        host.trust_response = record.attestation.host_trust_response.clone();
        host.assertion = Some(record.attestation.assertion.clone());
        host.state = RecordState::Active;
        host.audit.touch(SYSTEM_ACTOR, now);

        let id = host.id.clone();
        txn.put_host(host)?;
        let host = txn
            .host(&id)
            .ok_or_else(|| RegistryError::Invalid(format!("host {id} vanished mid-transaction")))?;

        Ok(UpsertOutcome {
            host,
            action,
            superseded,
        })
    }

    /// Verify and upsert every pulled record in one registry commit.
    ///
    /// Verification happens before the registry is locked. Verification
    /// failures and conflicts skip the affected host; any other registry
    /// failure aborts the pass and nothing is written.
    pub fn reconcile_all(&self, records: &[SourceRecord]) -> Result<ReconcileSummary, RegistryError> {
        let mut summary = ReconcileSummary::default();

        let mut verified_records = Vec::with_capacity(records.len());
        for record in records {
            let host_id = record.host.id.as_str();
            match self
                .verifier
                .verify(&record.attestation.assertion)
                .and_then(|v| v.ensure_subject(host_id).map(|_| v))
            {
                Ok(v) => verified_records.push((record, v)),
                Err(e) => {
                    warn!(host_id = %host_id, error = %e, "Assertion verification failed, skipping host");
                    summary.unverified += 1;
                }
            }
        }

        let now = Utc::now();
        let (outcomes, conflicts) = self.registry.transaction(|txn| {
            let mut outcomes = Vec::with_capacity(verified_records.len());
            let mut conflicts = 0;
            for (record, verified) in &verified_records {
                match txn.savepoint(|txn| self.stage_upsert(txn, record, verified, now)) {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e @ (RegistryError::Conflict { .. } | RegistryError::Invalid(_))) => {
                        warn!(host_id = %record.host.id, error = %e, "Host upsert rejected, skipping host");
                        conflicts += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok((outcomes, conflicts))
        })?;

        summary.conflicts = conflicts;
        for outcome in &outcomes {
            debug!(
                host_id = %outcome.host.id,
                action = ?outcome.action,
                trusted = outcome.host.trust.trusted,
                "Host reconciled"
            );
            for old in &outcome.superseded {
                info!(host_id = %outcome.host.id, superseded = %old, "Host re-enrolled, superseding old record");
            }
            summary.superseded += outcome.superseded.len();
            match outcome.action {
                UpsertAction::Created => summary.created += 1,
                UpsertAction::Updated => summary.updated += 1,
            }
        }

        info!(
            created = summary.created,
            updated = summary.updated,
            superseded = summary.superseded,
            unverified = summary.unverified,
            conflicts = summary.conflicts,
            "Host reconciliation complete"
        );

        Ok(summary)
    }
}
