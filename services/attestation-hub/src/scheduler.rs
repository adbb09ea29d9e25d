//! Sync Scheduler
//!
//! Drives the poll cycle: pull from the attestation authority, reconcile
//! hosts, sweep expired trust, advance the cursor, then dispatch.
//!
//! The cursor only advances after pull, reconcile and sweep all succeeded,
//! so an aborted cycle is retried from the same point on the next tick.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::cursor::CursorStore;
use crate::dispatcher::{DispatchReport, PluginDispatcher};
use crate::error::CycleError;
use crate::reconcile::{HostRegistryReconciler, ReconcileSummary};
use crate::registry::Registry;
use crate::source::{pull, AttestationSource, PullMode};
use crate::sweeper::{SweepSummary, TrustExpirySweeper};
use crate::verifier::{AssertionVerifier, DEFAULT_TAG_MARKER};

/// What one successful cycle did
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    /// Cursor the pull started from; `None` for a full pull
    pub since: Option<DateTime<Utc>>,
    pub pulled: usize,
    pub reconcile: ReconcileSummary,
    pub sweep: SweepSummary,
    pub dispatch: DispatchReport,
}

pub struct SyncScheduler {
    source: Arc<dyn AttestationSource>,
    cursor: Arc<dyn CursorStore>,
    reconciler: Arc<HostRegistryReconciler>,
    sweeper: Arc<TrustExpirySweeper>,
    dispatcher: Arc<PluginDispatcher>,
    cycle: Mutex<()>,
}

impl SyncScheduler {
    pub fn new(
        source: Arc<dyn AttestationSource>,
        verifier: Arc<dyn AssertionVerifier>,
        registry: Arc<Registry>,
        cursor: Arc<dyn CursorStore>,
        dispatcher: Arc<PluginDispatcher>,
    ) -> Self {
        Self {
            source,
            cursor,
            reconciler: Arc::new(HostRegistryReconciler::new(
                registry.clone(),
                verifier.clone(),
                DEFAULT_TAG_MARKER,
            )),
            sweeper: Arc::new(TrustExpirySweeper::new(registry, verifier)),
            dispatcher,
            cycle: Mutex::new(()),
        }
    }

    /// Use a different attribute marker for asset tags; call before the
    /// first cycle
    pub fn with_tag_marker(mut self, marker: impl Into<String>) -> Self {
        let marker = marker.into();
        match Arc::get_mut(&mut self.reconciler) {
            Some(reconciler) => reconciler.set_tag_marker(marker),
            None => warn!("Reconciler already shared, tag marker unchanged"),
        }
        self
    }

    /// Run one full cycle
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let _running = self.cycle.lock().await;

        let since = self.cursor.read_cursor().await?;
        let started_at = Utc::now();
        info!(since = ?since, "Starting sync cycle");

        let records = pull(self.source.as_ref(), PullMode::from_cursor(since)).await?;
        let pulled = records.len();

        // registry commits fsync the snapshot; keep them off the runtime threads
        let reconciler = self.reconciler.clone();
        let reconcile = spawn_blocking(move || reconciler.reconcile_all(&records)).await??;
        let sweeper = self.sweeper.clone();
        let sweep = spawn_blocking(move || sweeper.sweep()).await??;

        self.cursor.write_cursor(started_at).await?;

        let dispatch = self.dispatcher.dispatch().await;

        info!(
            pulled,
            created = reconcile.created,
            updated = reconcile.updated,
            expired = sweep.expired,
            delivered = dispatch.delivered(),
            failed = dispatch.failed(),
            "Sync cycle complete"
        );

        Ok(CycleReport {
            started_at,
            since,
            pulled,
            reconcile,
            sweep,
            dispatch,
        })
    }

    /// Run exactly one cycle (CronJob mode)
    pub async fn run_once(&self) -> Result<CycleReport, CycleError> {
        self.run_cycle().await
    }

    /// Cycle every `period` until `shutdown` resolves. Cycle failures are
    /// logged and the loop carries on with the next tick.
    pub async fn run<F>(&self, period: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = period.as_secs(), "Sync scheduler started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping sync scheduler");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Sync cycle failed");
                    }
                }
            }
        }
    }
}
