//! Periodic driver
//!
//! Runs every pass of the engine on a tokio interval. A tick only runs while
//! this node holds the durable lease, and every step is a synchronous unit of
//! work executed on the blocking pool. Passes start from durable state, so a
//! tick cut short by a crash, an error or a lost lease is resumed by the next
//! one, which first requeues whatever the failed tick left `PENDING`.

pub mod lease;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::time;

use crate::bus::outbox::Outbox;
use crate::config::SchedulerConfig;
use crate::error::{EngineError, Result};
use crate::ledger::RequestLedger;
use crate::packaging::aggregator::Aggregator;
use crate::service::archive_service::ArchiveService;
use crate::service::dispatch::{DispatchReport, RequestDispatcher};
use crate::service::result_service::ResultService;

use self::lease::{Lease, LeaseState};

pub const LEASE_NAME: &str = "engine-scheduler";

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub requeued: usize,
    pub expired: usize,
    pub dispatch: DispatchReport,
    pub bound: usize,
    pub closed: usize,
    pub packages_stored: usize,
    pub packages_failed: usize,
    pub groups_resolved: usize,
    pub published: usize,
}

pub struct Scheduler {
    ledger: Arc<dyn RequestLedger>,
    dispatcher: Arc<RequestDispatcher>,
    aggregator: Arc<Aggregator>,
    archives: Arc<ArchiveService>,
    results: Arc<ResultService>,
    outbox: Arc<Outbox>,
    lease: Lease,
    expiration: Duration,
    interval: StdDuration,
    page_size: usize,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn RequestLedger>,
        dispatcher: Arc<RequestDispatcher>,
        aggregator: Arc<Aggregator>,
        archives: Arc<ArchiveService>,
        results: Arc<ResultService>,
        outbox: Arc<Outbox>,
        lease: Lease,
        expiration: Duration,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            ledger,
            dispatcher,
            aggregator,
            archives,
            results,
            outbox,
            lease,
            expiration,
            interval: StdDuration::from_secs(config.interval_secs.max(1)),
            page_size: config.page_size.max(1),
        }
    }

    /// Run one tick at `now`. Returns `None` when another node holds the lease.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Option<TickReport>> {
        let state = self.lease.acquire(now)?;
        if !state.is_held() {
            debug!("Skipping tick, lease held elsewhere");
            return Ok(None);
        }

        let mut report = TickReport::default();
        let unfinished = self.lease.begin_work()?;
        if state == LeaseState::Acquired || unfinished {
            report.requeued = self.ledger.requeue_interrupted()?;
            if report.requeued > 0 {
                warn!("Requeued {} requests left pending by an interrupted tick", report.requeued);
            }
        }

        report.published += self.outbox.flush()?;

        report.expired = self.ledger.expire_older_than(now - self.expiration)?.len();
        self.renew(now)?;

        report.dispatch = self.dispatcher.dispatch_all()?;
        self.renew(now)?;

        let pass = self.aggregator.run_until_drained(now)?;
        report.bound = pass.bound;
        report.closed = pass.closed + self.aggregator.close_old_packages(now)?.len();
        // answers of bound files complete their ledger rows
        report.published += self.outbox.flush()?;
        self.renew(now)?;

        let packages = self.archives.dispatch_packages()?;
        report.packages_stored = packages.stored;
        report.packages_failed = packages.failed;
        report.published += self.outbox.flush()?;
        self.renew(now)?;

        report.groups_resolved = self.results.resolve_groups(self.page_size)?.len();
        report.published += self.outbox.flush()?;
        self.lease.finish_work()?;

        if report != TickReport::default() {
            info!("Tick finished: {:?}", report);
        }
        Ok(Some(report))
    }

    fn renew(&self, tick_start: DateTime<Utc>) -> Result<()> {
        self.lease.renew(tick_start.max(Utc::now()))
    }

    /// Give up the lease, typically on shutdown.
    pub fn release(&self) -> Result<()> {
        self.lease.release()
    }

    /// Start the periodic driver as a background task (non-blocking)
    pub fn start_background(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        info!(
            "Starting scheduler as {} with {}s interval",
            self.lease.owner(),
            self.interval.as_secs()
        );

        tokio::spawn(async move {
            let mut interval = time::interval(self.interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let scheduler = self.clone();
                match tokio::task::spawn_blocking(move || scheduler.tick(Utc::now())).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(EngineError::LeaseLost(name))) => warn!("Tick aborted, lease {} lost", name),
                    Ok(Err(e)) => error!("Tick failed: {}", e),
                    Err(e) => error!("Tick task panicked: {}", e),
                }
            }
        })
    }
}
