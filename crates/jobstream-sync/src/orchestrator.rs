//! Run lifecycle: `idle -> running -> {completed, completed_with_errors, failed, stopped}`.
//!
//! The orchestrator is the only writer of [`RunState`]. Producer and consumer
//! report through progress events; external readers get copies through
//! [`RunOrchestrator::snapshot`] or a `watch` receiver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use jobstream_core::{
    PhaseTiming, RunErrorEntry, RunPhase, RunState, RunStatus, RunSummary,
};
use jobstream_records::{ProcessorConfig, RecordProcessor, TagCodeTable};
use jobstream_storage::{BatchFileWriter, PageFetcher, RetryPolicy};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::persist::PersistenceCoordinator;
use crate::pipeline::{
    Consumer, ConsumerEnd, ConsumerReport, Producer, ProducerEnd, ProducerReport, ProgressEvent,
};
use crate::postgres::{PgJobStore, PgStoreConfig};
use crate::queue::ingestion_queue;
use crate::resume::{ResumeState, ResumeStore};
use crate::store::{JobStore, JsonFileStatsSink, StatsSink, TracingStatsSink};

const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("a run is already in progress")]
    AlreadyRunning,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct PhaseClock {
    current: Option<(RunPhase, DateTime<Utc>, Instant)>,
    done: Vec<PhaseTiming>,
}

impl PhaseClock {
    fn begin(&mut self, phase: RunPhase) {
        self.close();
        self.current = Some((phase, Utc::now(), Instant::now()));
    }

    fn close(&mut self) {
        if let Some((phase, started_at, started)) = self.current.take() {
            self.done.push(PhaseTiming {
                phase,
                started_at,
                elapsed_secs: started.elapsed().as_secs_f64(),
            });
        }
    }

    fn finish(mut self) -> Vec<PhaseTiming> {
        self.close();
        self.done
    }
}

struct Initialized {
    fetcher: PageFetcher,
    writer: BatchFileWriter,
    store: Option<Arc<dyn JobStore>>,
    start_page: u32,
}

/// How the scraping phase ended, before classification.
struct ScrapeOutcome {
    producer: Option<Result<ProducerReport, JoinError>>,
    consumer: Option<Result<ConsumerReport, JoinError>>,
    timed_out: bool,
    force_aborted: bool,
}

pub struct RunOrchestrator {
    config: SyncConfig,
    store: Option<Arc<dyn JobStore>>,
    sinks: Vec<Arc<dyn StatsSink>>,
    processor: Arc<RecordProcessor>,
    state: watch::Sender<RunState>,
    stop: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl RunOrchestrator {
    /// Builds the processor, the Postgres store (when enabled) and the
    /// default stats sinks. No connection is opened here.
    pub fn new(config: SyncConfig) -> anyhow::Result<Self> {
        let tag_codes = match &config.tag_rules_path {
            Some(path) => TagCodeTable::from_path(path)
                .with_context(|| format!("loading tag rules from {}", path.display()))?,
            None => TagCodeTable::default(),
        };
        let processor = RecordProcessor::new(ProcessorConfig {
            source_name: config.source_name.clone(),
            max_description_len: config.max_description_len,
            tag_codes,
        });

        let writer = BatchFileWriter::new(config.data_dir.clone());
        let mut sinks: Vec<Arc<dyn StatsSink>> = vec![
            Arc::new(TracingStatsSink),
            Arc::new(JsonFileStatsSink::new(writer)),
        ];
        let pg = PgStoreConfig::from_sync_config(&config).map(|c| Arc::new(PgJobStore::new(c)));
        let store = pg.clone().map(|pg| pg as Arc<dyn JobStore>);
        if let Some(pg) = pg {
            sinks.push(pg);
        }

        let (state, _) = watch::channel(RunState::default());
        Ok(Self {
            config,
            store,
            sinks,
            processor: Arc::new(processor),
            state,
            stop: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn with_store(mut self, store: Option<Arc<dyn JobStore>>) -> Self {
        self.store = store;
        self
    }

    pub fn with_sinks(mut self, sinks: Vec<Arc<dyn StatsSink>>) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Copy of the current run state.
    pub fn snapshot(&self) -> RunState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Resolves once no run is active, including the final sink and
    /// connection cleanup of a run that is finishing.
    pub async fn wait_until_idle(&self) {
        let mut state = self.subscribe();
        while self.is_running() {
            // The running flag drops after the last state write, so poll too.
            let _ = tokio::time::timeout(IDLE_POLL, state.changed()).await;
        }
    }

    /// Requests a cooperative stop. Returns false when no run is active.
    pub fn stop(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let token = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        token.cancel();
        info!("stop requested");
        true
    }

    /// Executes one run to a terminal state. The only error is a rejected
    /// concurrent invocation; every other outcome is in the summary.
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("run requested while another run is in progress");
            return Err(RunError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let stop = CancellationToken::new();
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = stop.clone();

        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        Ok(self.execute(run_id, stop).instrument(span).await)
    }

    async fn execute(&self, run_id: Uuid, stop: CancellationToken) -> RunSummary {
        let mut clock = PhaseClock::default();
        self.state.send_replace(RunState {
            run_id: Some(run_id),
            status: RunStatus::Running,
            start_time: Some(Utc::now()),
            start_page: 1,
            ..RunState::default()
        });
        info!(api_url = %self.config.api_url, "run started");

        self.enter(RunPhase::Initialization, &mut clock);
        let init = match self.initialize().await {
            Ok(init) => init,
            Err(err) => {
                error!(error = %format!("{err:#}"), "initialization failed");
                self.record_error(RunPhase::Initialization, "initialization", format!("{err:#}"));
                self.enter(RunPhase::Cleanup, &mut clock);
                return self
                    .finish(RunStatus::Failed, Some(format!("initialization failed: {err:#}")), clock)
                    .await;
            }
        };
        let database_degraded = self.store.is_some() && init.store.is_none();
        let resume = ResumeStore::new(init.writer.clone());

        self.enter(RunPhase::Scraping, &mut clock);
        let outcome = self.scrape(init, stop).await;

        self.enter(RunPhase::Cleanup, &mut clock);
        let (status, reason) = self.classify(&outcome, database_degraded);
        self.save_progress(&resume, &outcome, run_id).await;
        self.finish(status, reason, clock).await
    }

    fn enter(&self, phase: RunPhase, clock: &mut PhaseClock) {
        clock.begin(phase);
        self.state.send_modify(|s| s.phase = Some(phase));
        info!(phase = phase.as_str(), "entering phase");
    }

    fn record_error(&self, phase: RunPhase, kind: &str, message: impl Into<String>) {
        let entry = RunErrorEntry::new(phase, kind, message);
        self.state.send_modify(|s| s.errors.push(entry));
    }

    async fn initialize(&self) -> anyhow::Result<Initialized> {
        let writer = BatchFileWriter::new(self.config.data_dir.clone())
            .with_tabular_exports(self.config.export_tabular);
        writer
            .prepare()
            .await
            .with_context(|| format!("preparing data directory {}", self.config.data_dir.display()))?;

        let fetcher = PageFetcher::new(self.config.fetch_config()).context("building http client")?;
        let start_page = self.resume_page(&writer).await;
        self.state.send_modify(|s| s.start_page = start_page);

        let store = match &self.store {
            Some(store) if store.ensure_connection().await => Some(store.clone()),
            Some(_) => {
                warn!("database unavailable; batches go to local files for this run");
                self.record_error(
                    RunPhase::Initialization,
                    "database_unavailable",
                    "could not connect to the database; file fallback only",
                );
                None
            }
            None => {
                info!("database disabled; batches go to local files");
                None
            }
        };

        Ok(Initialized {
            fetcher,
            writer,
            store,
            start_page,
        })
    }

    async fn resume_page(&self, writer: &BatchFileWriter) -> u32 {
        if !self.config.resume {
            return 1;
        }
        let Some(saved) = ResumeStore::new(writer.clone()).load().await else {
            return 1;
        };
        let page = saved.start_page(
            Utc::now(),
            self.config.lookback_pages,
            self.config.max_resume_age(),
        );
        if self.config.max_pages.is_some_and(|max| page > max) {
            info!(page, "saved page is past the page ceiling; starting at page 1");
            return 1;
        }
        if page > 1 {
            info!(
                page,
                last_page = saved.last_page_scraped,
                lookback = self.config.lookback_pages,
                "resuming from saved scrape state"
            );
        } else {
            info!(
                complete = saved.complete,
                last_run = %saved.last_run,
                "previous scrape finished or is stale; starting at page 1"
            );
        }
        page
    }

    /// Records how far this run got so the next one can resume.
    async fn save_progress(&self, resume: &ResumeStore, outcome: &ScrapeOutcome, run_id: Uuid) {
        if !self.config.resume {
            return;
        }
        let Some(Ok(report)) = &outcome.producer else {
            return;
        };
        let Some(last_page) = report.last_page else {
            return;
        };
        let state = ResumeState {
            last_page_scraped: last_page,
            last_run: Utc::now(),
            complete: matches!(report.end, ProducerEnd::Exhausted | ProducerEnd::MaxPages),
            run_id: Some(run_id),
            jobs_persisted: self.state.borrow().jobs_persisted,
        };
        if let Err(err) = resume.save(&state).await {
            warn!(error = %err, "could not save scrape state");
        }
    }

    async fn scrape(&self, init: Initialized, stop: CancellationToken) -> ScrapeOutcome {
        let config = &self.config;
        let abort = CancellationToken::new();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (queue_tx, queue_rx) = ingestion_queue(config.queue_capacity);

        let producer = Producer {
            fetcher: Arc::new(init.fetcher),
            processor: self.processor.clone(),
            writer: init.writer.clone(),
            batch_size: config.batch_size,
            start_page: init.start_page,
            max_pages: config.max_pages,
            max_failed_pages: config.max_failed_pages,
            stop,
            abort: abort.clone(),
            events: events_tx.clone(),
        };
        let consumer = Consumer {
            coordinator: PersistenceCoordinator::new(
                init.store,
                init.writer.clone(),
                RetryPolicy::new(config.db_backoff()),
                config.circuit_breaker_threshold,
            ),
            writer: init.writer,
            max_consecutive_errors: config.max_consumer_errors.max(1),
            abort: abort.clone(),
            events: events_tx,
        };

        let mut producer_task = tokio::spawn(producer.run(queue_tx).in_current_span());
        let mut consumer_task = tokio::spawn(consumer.run(queue_rx).in_current_span());

        let deadline = tokio::time::sleep(config.run_timeout());
        tokio::pin!(deadline);

        let mut outcome = ScrapeOutcome {
            producer: None,
            consumer: None,
            timed_out: false,
            force_aborted: false,
        };

        while outcome.producer.is_none() || outcome.consumer.is_none() {
            tokio::select! {
                Some(event) = events.recv() => self.apply(event),
                joined = &mut producer_task, if outcome.producer.is_none() => {
                    outcome.producer = Some(joined);
                }
                joined = &mut consumer_task, if outcome.consumer.is_none() => {
                    outcome.consumer = Some(joined);
                }
                _ = &mut deadline => {
                    if outcome.timed_out {
                        error!("tasks did not exit within the shutdown grace period; aborting them");
                        producer_task.abort();
                        consumer_task.abort();
                        if outcome.producer.is_none() {
                            outcome.producer = Some((&mut producer_task).await);
                        }
                        if outcome.consumer.is_none() {
                            outcome.consumer = Some((&mut consumer_task).await);
                        }
                        outcome.force_aborted = true;
                        break;
                    }
                    warn!(timeout_secs = config.run_timeout_secs, "run timed out; cancelling tasks");
                    outcome.timed_out = true;
                    abort.cancel();
                    deadline
                        .as_mut()
                        .reset(tokio::time::Instant::now() + config.shutdown_grace());
                }
            }
        }

        while let Ok(event) = events.try_recv() {
            self.apply(event);
        }
        if outcome.force_aborted {
            self.account_abandoned();
        }
        outcome
    }

    /// Counts validated records that were neither stored, dumped nor reported
    /// lost when the tasks were killed. They were still buffered in the queue
    /// or inside an aborted task.
    fn account_abandoned(&self) {
        self.state.send_modify(|s| {
            let handled = s.jobs_persisted + s.jobs_lost + s.jobs_dumped;
            let abandoned = s.validation.validated.saturating_sub(handled);
            if abandoned == 0 {
                return;
            }
            error!(records = abandoned, "records abandoned by aborted tasks");
            s.jobs_lost += abandoned;
            s.errors.push(RunErrorEntry::new(
                RunPhase::Scraping,
                "records_abandoned",
                format!("{abandoned} validated records were in flight when tasks were aborted"),
            ));
        });
    }

    fn apply(&self, event: ProgressEvent) {
        self.state.send_modify(|s| match event {
            ProgressEvent::PageProcessed {
                listings, counts, ..
            } => {
                s.pages_processed += 1;
                s.jobs_found += listings;
                s.validation.absorb(counts);
            }
            ProgressEvent::PageFailed {
                page,
                kind,
                message,
            } => {
                s.failed_pages.push(page);
                s.errors
                    .push(RunErrorEntry::new(RunPhase::Scraping, kind, message));
            }
            ProgressEvent::BatchStored {
                records, to_file, ..
            } => {
                s.jobs_persisted += records;
                s.batches_persisted += 1;
                if to_file {
                    s.batches_to_file += 1;
                }
            }
            ProgressEvent::BatchLost {
                batch_id,
                records,
                reason,
            } => {
                s.jobs_lost += records;
                s.batches_lost += 1;
                s.errors.push(RunErrorEntry::new(
                    RunPhase::Scraping,
                    "batch_lost",
                    format!("batch {batch_id}: {reason}"),
                ));
            }
            ProgressEvent::CircuitOpened => {
                s.circuit_open = true;
                s.errors.push(RunErrorEntry::new(
                    RunPhase::Scraping,
                    "circuit_open",
                    "database circuit opened; remaining batches go to local files",
                ));
            }
            ProgressEvent::RecordsDumped {
                records,
                stored,
                reason,
            } => {
                if stored {
                    s.jobs_dumped += records;
                } else {
                    s.jobs_lost += records;
                }
                let message = if stored {
                    format!("{records} records written to emergency dump ({reason})")
                } else {
                    format!("{records} records lost; emergency dump failed ({reason})")
                };
                s.errors
                    .push(RunErrorEntry::new(RunPhase::Scraping, "emergency_dump", message));
            }
        });
    }

    fn classify(&self, outcome: &ScrapeOutcome, database_degraded: bool) -> (RunStatus, Option<String>) {
        if outcome.timed_out {
            let reason = if outcome.force_aborted {
                "timeout; tasks aborted after grace period"
            } else {
                "timeout"
            };
            return (RunStatus::CompletedWithErrors, Some(reason.to_string()));
        }

        let producer = match &outcome.producer {
            Some(Ok(report)) => report,
            Some(Err(err)) => {
                return (RunStatus::Failed, Some(format!("producer task failed: {err}")));
            }
            None => return (RunStatus::Failed, Some("producer task did not finish".into())),
        };
        let consumer = match &outcome.consumer {
            Some(Ok(report)) => report,
            Some(Err(err)) => {
                return (RunStatus::Failed, Some(format!("consumer task failed: {err}")));
            }
            None => return (RunStatus::Failed, Some("consumer task did not finish".into())),
        };

        if let ProducerEnd::Failed(message) = &producer.end {
            return (RunStatus::Failed, Some(message.clone()));
        }
        if producer.end == ProducerEnd::Stopped {
            return (RunStatus::Stopped, Some("stop requested".into()));
        }
        match consumer.end {
            ConsumerEnd::TooManyErrors => {
                return (
                    RunStatus::CompletedWithErrors,
                    Some(format!(
                        "consumer stopped after {} consecutive batch failures",
                        self.config.max_consumer_errors
                    )),
                );
            }
            ConsumerEnd::Disconnected | ConsumerEnd::Aborted => {
                return (
                    RunStatus::CompletedWithErrors,
                    Some("consumer ended before the end of input".into()),
                );
            }
            ConsumerEnd::Sentinel => {}
        }

        let state = self.state.borrow();
        if state.batches_lost > 0 || state.jobs_lost > 0 {
            return (
                RunStatus::CompletedWithErrors,
                Some(format!("{} batches lost", state.batches_lost)),
            );
        }
        if state.circuit_open {
            return (RunStatus::CompletedWithErrors, Some("database circuit opened".into()));
        }
        if database_degraded {
            return (RunStatus::CompletedWithErrors, Some("database unavailable".into()));
        }
        (RunStatus::Completed, None)
    }

    async fn finish(&self, status: RunStatus, reason: Option<String>, clock: PhaseClock) -> RunSummary {
        self.state.send_modify(|s| {
            s.status = status;
            s.end_time = Some(Utc::now());
        });
        let summary = {
            let state = self.state.borrow();
            RunSummary::from_state(&state, reason, clock.finish())
        };

        for sink in &self.sinks {
            if let Err(err) = sink.record_run(&summary).await {
                warn!(sink = sink.name(), error = %format!("{err:#}"), "stats sink failed");
            }
        }
        if let Some(store) = &self.store {
            store.close().await;
        }

        info!(
            status = %summary.status,
            reason = summary.reason.as_deref().unwrap_or(""),
            persisted = summary.jobs_persisted,
            "run finished"
        );
        summary
    }
}
