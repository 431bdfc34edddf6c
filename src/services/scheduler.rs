//! Refresh scheduler.
//!
//! A single actor task owns the whole refresh pipeline: fetch odds per
//! sport, run the detector, swap the latest snapshot and append the
//! opportunity log. Three inputs drive it (interval timer, manual trigger
//! requests, shutdown signal) and exactly one refresh is in flight at any
//! instant. Ticks that land mid-cycle are dropped; manual requests that
//! land mid-cycle ride along and receive the in-flight cycle's report.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::db::{self, StoreError};
use crate::models::{Event, QuotaSnapshot, RunReport, RunStatus, Sport};
use crate::services::detector::{detect, DetectorConfig};
use crate::services::odds_client::{OddsApiError, OddsSource};

/// Attempts per sport on transient upstream failures.
const FETCH_ATTEMPTS: u32 = 3;

/// How long shutdown waits for the in-flight cycle to reach a safe point.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct RefreshRequest {
    reply: oneshot::Sender<Arc<RunReport>>,
}

#[derive(Default)]
pub struct SchedulerShared {
    last_run: RwLock<Option<Arc<RunReport>>>,
    quota: RwLock<Option<QuotaSnapshot>>,
}

/// Cheap clone handed to the API layer and the CLI.
#[derive(Clone)]
pub struct SchedulerHandle {
    trigger_tx: mpsc::Sender<RefreshRequest>,
    shared: Arc<SchedulerShared>,
}

impl SchedulerHandle {
    /// Request a refresh and wait for its report. Joins the in-flight cycle
    /// when one is running. Returns a cancelled report when the scheduler is
    /// shutting down.
    pub async fn trigger(&self) -> Arc<RunReport> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .trigger_tx
            .send(RefreshRequest { reply: reply_tx })
            .await
            .is_err()
        {
            return Arc::new(cancelled_report(Utc::now()));
        }
        match reply_rx.await {
            Ok(report) => report,
            Err(_) => Arc::new(cancelled_report(Utc::now())),
        }
    }

    pub fn last_run(&self) -> Option<Arc<RunReport>> {
        self.shared.last_run.read().clone()
    }

    pub fn quota(&self) -> Option<QuotaSnapshot> {
        self.shared.quota.read().clone()
    }
}

/// Spawn the scheduler actor. The returned handle triggers refreshes and
/// reads published state; the join handle resolves once shutdown drains.
pub fn spawn(
    pool: SqlitePool,
    source: Arc<dyn OddsSource>,
    config: AppConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> (SchedulerHandle, JoinHandle<()>) {
    let (trigger_tx, trigger_rx) = mpsc::channel(16);
    let shared = Arc::new(SchedulerShared::default());

    let handle = SchedulerHandle {
        trigger_tx,
        shared: shared.clone(),
    };

    let detector = DetectorConfig::from_app(&config);
    let actor = SchedulerActor {
        pool,
        source,
        config,
        detector,
        shared,
        trigger_rx,
        shutdown_rx,
    };
    let join = tokio::spawn(actor.run());

    (handle, join)
}

struct SchedulerActor {
    pool: SqlitePool,
    source: Arc<dyn OddsSource>,
    config: AppConfig,
    detector: DetectorConfig,
    shared: Arc<SchedulerShared>,
    trigger_rx: mpsc::Receiver<RefreshRequest>,
    shutdown_rx: watch::Receiver<bool>,
}

struct CycleResult {
    report: RunReport,
    /// Set when upstream reported 429 with a known reset delay.
    suppress_ticks_for_secs: Option<u64>,
}

/// Everything a cycle task needs, detached from the actor's own receivers
/// so select-arm borrows never overlap with cycle starts.
struct CycleContext {
    pool: SqlitePool,
    source: Arc<dyn OddsSource>,
    config: AppConfig,
    detector: DetectorConfig,
    shared: Arc<SchedulerShared>,
    shutdown: watch::Receiver<bool>,
}

impl CycleContext {
    fn start(&self, done_tx: mpsc::Sender<CycleResult>) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let source = self.source.clone();
        let config = self.config.clone();
        let detector = self.detector.clone();
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let result = run_cycle(pool, source, config, detector, shared, shutdown).await;
            let _ = done_tx.send(result).await;
        })
    }
}

impl SchedulerActor {
    async fn run(self) {
        let SchedulerActor {
            pool,
            source,
            config,
            detector,
            shared,
            mut trigger_rx,
            mut shutdown_rx,
        } = self;

        let ctx = CycleContext {
            pool,
            source,
            config: config.clone(),
            detector,
            shared: shared.clone(),
            shutdown: shutdown_rx.clone(),
        };

        let (done_tx, mut done_rx) = mpsc::channel::<CycleResult>(1);
        let mut waiters: Vec<oneshot::Sender<Arc<RunReport>>> = Vec::new();
        let mut current: Option<JoinHandle<()>> = None;
        let mut suppress_until: Option<tokio::time::Instant> = None;

        let interval_enabled = config.refresh_interval_s > 0;
        let period = Duration::from_secs(config.refresh_interval_s.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        if interval_enabled {
            tracing::info!("Refresh scheduler started (every {}s)", config.refresh_interval_s);
        } else {
            tracing::info!("Refresh scheduler started (manual-only mode)");
        }

        loop {
            tokio::select! {
                // First tick fires immediately: that is the startup refresh.
                _ = ticker.tick(), if interval_enabled => {
                    if current.is_some() {
                        tracing::info!("Refresh tick dropped: a cycle is already running");
                    } else if suppress_until.is_some_and(|until| tokio::time::Instant::now() < until) {
                        tracing::info!("Refresh tick suppressed until quota reset");
                    } else {
                        current = Some(ctx.start(done_tx.clone()));
                    }
                }
                Some(request) = trigger_rx.recv() => {
                    waiters.push(request.reply);
                    if current.is_none() {
                        current = Some(ctx.start(done_tx.clone()));
                    } else {
                        tracing::debug!("Manual refresh joins the in-flight cycle");
                    }
                }
                Some(result) = done_rx.recv() => {
                    current = None;
                    if let Some(secs) = result.suppress_ticks_for_secs {
                        suppress_until =
                            Some(tokio::time::Instant::now() + Duration::from_secs(secs));
                        tracing::warn!("Quota exhausted: automatic refresh paused for {}s", secs);
                    }
                    let report = Arc::new(result.report);
                    *shared.last_run.write() = Some(report.clone());
                    for waiter in waiters.drain(..) {
                        let _ = waiter.send(report.clone());
                    }
                    tracing::info!(
                        "Refresh cycle finished: {:?} ({} events, {} detected, {} persisted)",
                        report.status, report.events_fetched, report.detected, report.persisted
                    );
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        // The in-flight cycle sees the same shutdown signal and stops at its
        // next safe point; give it a bounded window to report back.
        if let Some(handle) = current.take() {
            match tokio::time::timeout(DRAIN_TIMEOUT, done_rx.recv()).await {
                Ok(Some(result)) => {
                    let report = Arc::new(result.report);
                    *shared.last_run.write() = Some(report.clone());
                    for waiter in waiters.drain(..) {
                        let _ = waiter.send(report.clone());
                    }
                }
                _ => handle.abort(),
            }
        }

        let report = Arc::new(cancelled_report(Utc::now()));
        for waiter in waiters.drain(..) {
            let _ = waiter.send(report.clone());
        }
        while let Ok(request) = trigger_rx.try_recv() {
            let _ = request.reply.send(report.clone());
        }
        tracing::info!("Refresh scheduler stopped");
    }
}

// ── Refresh cycle ─────────────────────────────────────────────────────────────

async fn run_cycle(
    pool: SqlitePool,
    source: Arc<dyn OddsSource>,
    config: AppConfig,
    detector: DetectorConfig,
    shared: Arc<SchedulerShared>,
    mut shutdown: watch::Receiver<bool>,
) -> CycleResult {
    let started_at = Utc::now();
    let mut errors: Vec<String> = Vec::new();
    let mut partial = false;
    let mut last_quota: Option<QuotaSnapshot> = None;

    tracing::info!("🔄  Refresh cycle started");

    // ── Catalogue sync + poll list ───────────────────────────────────────────
    let sports = match source.list_sports().await {
        Ok(catalogue) => {
            if let Err(e) = db::replace_sports(&pool, &catalogue).await {
                errors.push(format!("catalogue store: {}", e));
                partial = true;
            }
            resolve_poll_list(&config, &catalogue)
        }
        Err(OddsApiError::Auth) => {
            errors.push("catalogue: invalid API key".to_string());
            return failed(started_at, 0, errors, last_quota);
        }
        Err(OddsApiError::QuotaExhausted { reset_after_secs }) => {
            errors.push("catalogue: request quota exhausted".to_string());
            return quota_abort(started_at, 0, errors, last_quota, reset_after_secs);
        }
        Err(e) if !config.sports.is_empty() => {
            // The allow-list still tells us what to poll
            errors.push(format!("catalogue: {}", e));
            partial = true;
            config.sports.clone()
        }
        Err(e) => {
            errors.push(format!("catalogue: {}", e));
            return failed(started_at, 0, errors, last_quota);
        }
    };

    // ── Fetch, one request per sport ─────────────────────────────────────────
    let mut events: Vec<Event> = Vec::new();
    let mut polled = 0usize;

    for sport in &sports {
        if *shutdown.borrow() {
            return cancelled(started_at, polled, errors, last_quota);
        }

        match fetch_with_retry(source.as_ref(), sport, &mut shutdown).await {
            Ok((mut sport_events, quota)) => {
                if let Some(quota) = quota {
                    *shared.quota.write() = Some(quota.clone());
                    last_quota = Some(quota);
                }
                events.append(&mut sport_events);
                polled += 1;
            }
            Err(FetchFailure::Cancelled) => {
                return cancelled(started_at, polled, errors, last_quota);
            }
            Err(FetchFailure::Api(OddsApiError::Auth)) => {
                errors.push(format!("{}: invalid API key", sport));
                return failed(started_at, polled, errors, last_quota);
            }
            Err(FetchFailure::Api(OddsApiError::QuotaExhausted { reset_after_secs })) => {
                errors.push(format!("{}: request quota exhausted", sport));
                return quota_abort(started_at, polled, errors, last_quota, reset_after_secs);
            }
            Err(FetchFailure::Api(e)) => {
                tracing::warn!("Refresh: skipping {} this cycle: {}", sport, e);
                errors.push(format!("{}: {}", sport, e));
                partial = true;
            }
        }
    }

    // ── Detect ───────────────────────────────────────────────────────────────
    let opportunities = detect(&events, &detector, Utc::now());

    // ── Persist: latest snapshot first, then the opportunity log ─────────────
    let mut persisted = 0usize;
    match write_with_retry(|| db::replace_latest(&pool, &events)).await {
        Ok(()) => match write_with_retry(|| db::append_opportunities(&pool, &opportunities)).await {
            Ok(inserted) => persisted = inserted,
            Err(e) => {
                // The latest snapshot stays authoritative
                tracing::error!("Opportunity log write failed: {}", e);
                errors.push(format!("opportunity log: {}", e));
                partial = true;
            }
        },
        Err(e) => {
            tracing::error!("Latest snapshot write failed, prior snapshot kept: {}", e);
            errors.push(format!("latest snapshot: {}", e));
            return CycleResult {
                report: RunReport {
                    status: RunStatus::Failed,
                    started_at,
                    finished_at: Utc::now(),
                    sports_polled: polled,
                    events_fetched: events.len(),
                    detected: opportunities.len(),
                    persisted: 0,
                    errors,
                    quota: last_quota,
                },
                suppress_ticks_for_secs: None,
            };
        }
    }

    let status = if partial || !errors.is_empty() {
        RunStatus::Partial
    } else {
        RunStatus::Completed
    };

    CycleResult {
        report: RunReport {
            status,
            started_at,
            finished_at: Utc::now(),
            sports_polled: polled,
            events_fetched: events.len(),
            detected: opportunities.len(),
            persisted,
            errors,
            quota: last_quota,
        },
        suppress_ticks_for_secs: None,
    }
}

/// The allow-list wins when configured; otherwise poll every active sport
/// from the catalogue.
fn resolve_poll_list(config: &AppConfig, catalogue: &[Sport]) -> Vec<String> {
    if config.sports.is_empty() {
        return catalogue
            .iter()
            .filter(|s| s.active)
            .map(|s| s.key.clone())
            .collect();
    }

    for key in &config.sports {
        if !catalogue.is_empty() && !catalogue.iter().any(|s| &s.key == key) {
            tracing::warn!("Configured sport {:?} not in upstream catalogue", key);
        }
    }
    config.sports.clone()
}

enum FetchFailure {
    Cancelled,
    Api(OddsApiError),
}

/// Up to three attempts on transient failures, exponential backoff with
/// ±10% jitter. Shutdown cancels mid-request and mid-backoff.
async fn fetch_with_retry(
    source: &dyn OddsSource,
    sport: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(Vec<Event>, Option<QuotaSnapshot>), FetchFailure> {
    let mut last_message = String::new();

    for attempt in 0..FETCH_ATTEMPTS {
        if attempt > 0 {
            let base = Duration::from_secs(1 << (attempt - 1));
            let delay = base.mul_f64(rand::thread_rng().gen_range(0.9..=1.1));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return Err(FetchFailure::Cancelled),
            }
        }

        let result = tokio::select! {
            result = source.get_odds(sport) => result,
            _ = shutdown.changed() => return Err(FetchFailure::Cancelled),
        };

        match result {
            Ok(response) => return Ok(response),
            Err(OddsApiError::Transient(message)) => {
                tracing::warn!(
                    "Refresh: transient failure fetching {} (attempt {}/{}): {}",
                    sport,
                    attempt + 1,
                    FETCH_ATTEMPTS,
                    message
                );
                last_message = message;
            }
            Err(e) => return Err(FetchFailure::Api(e)),
        }
    }

    Err(FetchFailure::Api(OddsApiError::Transient(last_message)))
}

/// Store writes get a single retry before the cycle gives up on them.
async fn write_with_retry<T, F, Fut>(mut write: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    match write().await {
        Ok(value) => Ok(value),
        Err(first) => {
            tracing::warn!("Store write failed, retrying once: {}", first);
            write().await
        }
    }
}

fn cancelled_report(started_at: chrono::DateTime<Utc>) -> RunReport {
    RunReport {
        status: RunStatus::Cancelled,
        started_at,
        finished_at: Utc::now(),
        sports_polled: 0,
        events_fetched: 0,
        detected: 0,
        persisted: 0,
        errors: Vec::new(),
        quota: None,
    }
}

fn cancelled(
    started_at: chrono::DateTime<Utc>,
    polled: usize,
    errors: Vec<String>,
    quota: Option<QuotaSnapshot>,
) -> CycleResult {
    tracing::info!("Refresh cycle cancelled by shutdown; partial fetch discarded");
    CycleResult {
        report: RunReport {
            status: RunStatus::Cancelled,
            started_at,
            finished_at: Utc::now(),
            sports_polled: polled,
            events_fetched: 0,
            detected: 0,
            persisted: 0,
            errors,
            quota,
        },
        suppress_ticks_for_secs: None,
    }
}

fn failed(
    started_at: chrono::DateTime<Utc>,
    polled: usize,
    errors: Vec<String>,
    quota: Option<QuotaSnapshot>,
) -> CycleResult {
    CycleResult {
        report: RunReport {
            status: RunStatus::Failed,
            started_at,
            finished_at: Utc::now(),
            sports_polled: polled,
            events_fetched: 0,
            detected: 0,
            persisted: 0,
            errors,
            quota,
        },
        suppress_ticks_for_secs: None,
    }
}

fn quota_abort(
    started_at: chrono::DateTime<Utc>,
    polled: usize,
    errors: Vec<String>,
    quota: Option<QuotaSnapshot>,
    reset_after_secs: Option<u64>,
) -> CycleResult {
    CycleResult {
        report: RunReport {
            status: RunStatus::Partial,
            started_at,
            finished_at: Utc::now(),
            sports_polled: polled,
            events_fetched: 0,
            detected: 0,
            persisted: 0,
            errors,
            quota,
        },
        suppress_ticks_for_secs: reset_after_secs,
    }
}
