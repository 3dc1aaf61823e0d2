//! Test-run scheduler
//!
//! Owns the attached devices, the test registry and the case catalog. A run
//! walks the selection set by set: each set gets a fresh traffic log file and
//! a fresh instance bound to the whole device group, and each case
//! invocation is a cancellable unit. Only one run is active at a time.

use chrono::Local;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::device::{CallOptions, CapabilityRegistry, Device, DeviceGroup, BOOTSTRAP_TIMEOUT, DEFAULT_CALL_TIMEOUT};
use crate::core::logger::{LogFormat, TrafficLog};
use crate::core::protocol::FrameCodec;
use crate::core::testing::{
    execute_case, CaseCatalog, CaseContext, CaseMeta, CaseOutcome, JsonLinesSink, Reporter, ResultSink, TestRegistry,
};
use crate::core::transport::{list_ports, SerialConfig, Transport, TransportError};

/// Per-run log directory name
pub const RUN_DIR_FORMAT: &str = "%Y-%m-%d-%H-%M";
/// Cost-time ledger written into the run directory
pub const COST_TIME_FILE: &str = "costtime.txt";

/// Scheduler errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// `run` or `discover` called while a run is active
    #[error("A test run is already active")]
    RunAlreadyActive,

    /// Log or report destination could not be prepared
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Port enumeration failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Root of the per-run log directories
    pub log_dir: PathBuf,
    /// Where a JSON-lines report is written per run, if anywhere
    pub report_dir: Option<PathBuf>,
    /// Traffic log format
    pub log_format: LogFormat,
    /// Repeat count handed to repeatable cases
    pub circle: u32,
    /// Write `costtime.txt`
    pub record_cost_time: bool,
    /// Operation called after a blocked case and on connect
    pub reset_operation: Option<String>,
    /// Issue the reset operation to every discovered device
    pub reset_on_connect: bool,
    /// Timeout of the bootstrap call
    pub bootstrap_timeout: Duration,
    /// Default per-call timeout of discovered devices
    pub call_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            report_dir: None,
            log_format: LogFormat::Text,
            circle: 3,
            record_cost_time: false,
            reset_operation: None,
            reset_on_connect: false,
            bootstrap_timeout: BOOTSTRAP_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Progress events
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// Run started
    RunStarted {
        /// Run identifier
        run_id: Uuid,
        /// Selected cases
        cases: usize,
    },
    /// A case invocation started
    CaseStarted {
        /// Test set
        set: String,
        /// Case number
        no: String,
    },
    /// A case invocation finished
    CaseFinished {
        /// Test set
        set: String,
        /// Case number
        no: String,
        /// How it ended
        outcome: CaseOutcome,
    },
    /// A case invocation was cancelled
    CaseCancelled {
        /// Test set
        set: String,
        /// Case number
        no: String,
    },
    /// Run finished
    RunFinished {
        /// Totals
        summary: RunSummary,
    },
}

/// Totals of one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Run identifier
    pub run_id: Uuid,
    /// Directory holding the traffic logs
    pub log_dir: PathBuf,
    /// Invocations that ran to completion or were blocked
    pub invocations: usize,
    /// Invocations that ended in BLOCK
    pub blocked: usize,
    /// Invocations cancelled while in flight
    pub cancelled: usize,
    /// Whether `stop` ended the run early
    pub stopped: bool,
}

/// Test-run scheduler
pub struct Scheduler {
    settings: RwLock<SchedulerSettings>,
    registry: RwLock<TestRegistry>,
    catalog: Mutex<CaseCatalog>,
    devices: RwLock<Vec<Arc<Device>>>,
    reporter: Reporter,
    traffic: TrafficLog,
    running: AtomicBool,
    run_token: Mutex<Option<CancellationToken>>,
    unit_token: Mutex<Option<CancellationToken>>,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("devices", &self.devices.read().len())
            .field("sets", &self.registry.read().len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Unconditional end-of-run teardown
struct RunGuard<'a> {
    scheduler: &'a Scheduler,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let scheduler = self.scheduler;
        scheduler.reporter.close();
        {
            let mut traffic = scheduler.traffic.lock();
            traffic.flush();
            traffic.stop();
        }
        scheduler.unit_token.lock().take();
        scheduler.run_token.lock().take();
        scheduler.running.store(false, Ordering::SeqCst);
        tracing::debug!("Run teardown complete");
    }
}

impl Scheduler {
    /// Scheduler with no devices and an empty registry
    pub fn new(settings: SchedulerSettings, traffic: TrafficLog) -> Self {
        Self {
            settings: RwLock::new(settings),
            registry: RwLock::new(TestRegistry::new()),
            catalog: Mutex::new(CaseCatalog::new()),
            devices: RwLock::new(Vec::new()),
            reporter: Reporter::new(),
            traffic,
            running: AtomicBool::new(false),
            run_token: Mutex::new(None),
            unit_token: Mutex::new(None),
            event_tx: None,
        }
    }

    /// Publish progress events to `tx`
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Current settings
    pub fn settings(&self) -> SchedulerSettings {
        self.settings.read().clone()
    }

    /// Change the repeat count handed to repeatable cases
    pub fn set_circle(&self, circle: u32) {
        self.settings.write().circle = circle.max(1);
    }

    /// Whether a run is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shared traffic logger
    pub fn traffic(&self) -> &TrafficLog {
        &self.traffic
    }

    /// Replace the test registry and rescan the catalog
    pub fn load_tests(&self, registry: TestRegistry) {
        self.catalog.lock().load(&registry);
        *self.registry.write() = registry;
    }

    /// Edit the catalog between runs
    pub fn with_catalog<R>(&self, f: impl FnOnce(&mut CaseCatalog) -> R) -> R {
        f(&mut self.catalog.lock())
    }

    /// Snapshot of the catalog
    pub fn catalog(&self) -> CaseCatalog {
        self.catalog.lock().clone()
    }

    /// Attach a result sink for the next run; it is closed and detached at
    /// the end of that run
    pub fn attach_sink(&self, sink: Box<dyn ResultSink>) {
        self.reporter.attach(sink);
    }

    /// Add an already connected device
    pub fn attach_device(&self, device: Device) -> Arc<Device> {
        let device = Arc::new(device);
        self.devices.write().push(device.clone());
        device
    }

    /// Attached devices
    pub fn devices(&self) -> DeviceGroup {
        DeviceGroup::new(self.devices.read().clone())
    }

    /// Close and forget every attached device
    pub async fn close_devices(&self) {
        let devices: Vec<Arc<Device>> = std::mem::take(&mut *self.devices.write());
        DeviceGroup::new(devices).close().await;
    }

    /// Replace the attached devices with every responding serial port
    ///
    /// Ports that fail to open or stay silent are skipped. Returns the number
    /// of devices found.
    pub async fn discover(
        &self,
        serial: &SerialConfig,
        codec: &FrameCodec,
        registry: &CapabilityRegistry,
    ) -> Result<usize, SchedulerError> {
        if self.is_running() {
            return Err(SchedulerError::RunAlreadyActive);
        }
        self.close_devices().await;

        let settings = self.settings();
        let ports = list_ports()?;
        tracing::info!(count = ports.len(), "Probing serial ports");

        for port in ports {
            let config = serial.for_port(&port);
            let transport = match Transport::open_serial(&config, codec.clone(), self.traffic.clone()) {
                Ok(transport) => transport,
                Err(e) => {
                    tracing::warn!(port = %port, error = %e, "Open failed, skipping");
                    continue;
                }
            };
            let device = match Device::connect(transport, registry.clone(), settings.bootstrap_timeout).await {
                Ok(device) => device.with_call_timeout(settings.call_timeout),
                Err(e) => {
                    tracing::info!(port = %port, error = %e, "No device, skipping");
                    continue;
                }
            };
            if settings.reset_on_connect {
                if let Some(reset) = settings.reset_operation.as_deref() {
                    if let Err(e) = device.call(reset, &json!({}), CallOptions::default()).await {
                        tracing::warn!(port = %port, error = %e, "Reset on connect failed");
                    }
                }
            }
            tracing::info!(port = %port, info = ?device.info(), "Device attached");
            self.attach_device(device);
        }
        Ok(self.devices.read().len())
    }

    /// Pause both flow-control axes of every device
    pub fn pause(&self) {
        self.devices().pause();
    }

    /// Resume every device
    pub fn resume(&self) {
        self.devices().resume();
    }

    /// Cancel the in-flight case invocation; the run moves on to the next one
    pub fn cancel_current(&self) {
        if let Some(token) = self.unit_token.lock().as_ref() {
            tracing::info!("Cancelling current case");
            token.cancel();
        }
    }

    /// Cancel the in-flight invocation and end the run
    pub fn stop(&self) {
        if let Some(token) = self.run_token.lock().as_ref() {
            tracing::info!("Stopping run");
            token.cancel();
        }
    }

    /// Publish without waiting; a full channel drops the event
    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("Event channel full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Run every selected case
    ///
    /// Teardown (sinks closed and detached, traffic log flushed, running flag
    /// cleared) happens however the run ends.
    pub async fn run(&self) -> Result<RunSummary, SchedulerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::RunAlreadyActive);
        }
        let run_token = CancellationToken::new();
        *self.run_token.lock() = Some(run_token.clone());
        let _guard = RunGuard { scheduler: self };

        let settings = self.settings();
        let registry = self.registry.read().clone();
        let selection = self.catalog.lock().selection();
        let devices = self.devices();

        let run_id = Uuid::new_v4();
        let run_dir = settings.log_dir.join(Local::now().format(RUN_DIR_FORMAT).to_string());
        std::fs::create_dir_all(&run_dir)?;
        if let Some(report_dir) = &settings.report_dir {
            let path = report_dir.join(format!("{}.jsonl", run_id));
            self.reporter.attach(Box::new(JsonLinesSink::create(&path)?));
        }

        let total: usize = selection.iter().map(|(_, cases)| cases.len()).sum();
        tracing::info!(%run_id, cases = total, devices = devices.len(), dir = %run_dir.display(), "Run started");
        self.emit(SchedulerEvent::RunStarted { run_id, cases: total });

        let mut summary = RunSummary {
            run_id,
            log_dir: run_dir.clone(),
            invocations: 0,
            blocked: 0,
            cancelled: 0,
            stopped: false,
        };

        'sets: for (set, cases) in selection {
            let Some(def) = registry.get(&set) else {
                tracing::warn!(set = %set, "Selected test set not registered");
                continue;
            };
            let log_path = run_dir.join(format!("{}.{}", set, settings.log_format.extension()));
            self.traffic.lock().start(&log_path, settings.log_format)?;
            let mut instance = def.instantiate(&devices);

            for meta in cases {
                if run_token.is_cancelled() {
                    summary.stopped = true;
                    break 'sets;
                }
                let unit = run_token.child_token();
                *self.unit_token.lock() = Some(unit.clone());

                let mut ctx = CaseContext::new(devices.clone(), self.reporter.clone(), self.traffic.clone(), meta.clone())
                    .with_reset(settings.reset_operation.clone());
                if meta.repeatable {
                    ctx = ctx.with_circle(settings.circle.max(1));
                }

                self.emit(SchedulerEvent::CaseStarted {
                    set: set.clone(),
                    no: meta.no.clone(),
                });

                let outcome = tokio::select! {
                    outcome = execute_case(instance.as_mut(), &mut ctx) => Some(outcome),
                    _ = unit.cancelled() => None,
                };
                self.unit_token.lock().take();

                match outcome {
                    Some(outcome) => {
                        summary.invocations += 1;
                        if outcome.error.is_some() {
                            summary.blocked += 1;
                        }
                        if let Some(cost) = outcome.cost_time {
                            self.catalog.lock().update_cost_time(&set, &meta.no, cost);
                            if settings.record_cost_time {
                                record_cost_time(&run_dir, &meta, cost);
                            }
                        }
                        self.emit(SchedulerEvent::CaseFinished {
                            set: set.clone(),
                            no: meta.no.clone(),
                            outcome,
                        });
                    }
                    None => {
                        summary.cancelled += 1;
                        tracing::warn!(set = %set, no = %meta.no, "Case cancelled");
                        self.traffic.lock().log_info(&format!("{} cancelled", meta.no));
                        self.emit(SchedulerEvent::CaseCancelled {
                            set: set.clone(),
                            no: meta.no.clone(),
                        });
                    }
                }
            }
            self.traffic.lock().flush();
        }

        if run_token.is_cancelled() {
            summary.stopped = true;
        }
        tracing::info!(
            %run_id,
            invocations = summary.invocations,
            blocked = summary.blocked,
            cancelled = summary.cancelled,
            stopped = summary.stopped,
            "Run finished"
        );
        self.emit(SchedulerEvent::RunFinished {
            summary: summary.clone(),
        });
        Ok(summary)
    }
}

fn record_cost_time(run_dir: &Path, meta: &CaseMeta, cost: Duration) {
    let path = run_dir.join(COST_TIME_FILE);
    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| writeln!(file, "{}: {}", meta.no, cost.as_secs_f64()));
    if let Err(e) = written {
        tracing::warn!(path = %path.display(), error = %e, "Cost-time ledger write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logger;
    use crate::core::testing::{CaseSpec, MemorySink, TestSet, TestSetDef, Verdict};
    use async_trait::async_trait;

    struct Counter;

    #[async_trait]
    impl TestSet for Counter {
        async fn run(&mut self, case_no: &str, ctx: &mut CaseContext) -> anyhow::Result<()> {
            match case_no {
                "TC_REPEAT" => {
                    let circle = ctx.circle().unwrap_or(1);
                    for round in 1..=circle {
                        ctx.log(&format!("round {}/{}", round, circle));
                    }
                    Ok(())
                }
                "TC_BOOM" => anyhow::bail!("boom"),
                _ => Ok(()),
            }
        }
    }

    fn scheduler(dir: &Path) -> Scheduler {
        let settings = SchedulerSettings {
            log_dir: dir.to_path_buf(),
            circle: 2,
            record_cost_time: true,
            ..SchedulerSettings::default()
        };
        let scheduler = Scheduler::new(settings, logger::shared());
        let mut registry = TestRegistry::new();
        registry
            .add(
                TestSetDef::new("Counter", |_| Box::new(Counter))
                    .case(CaseSpec::new("TC_ONCE"))
                    .case(CaseSpec::new("TC_BOOM"))
                    .case(CaseSpec::new("TC_REPEAT").repeatable()),
            )
            .unwrap();
        scheduler.load_tests(registry);
        scheduler
    }

    #[tokio::test]
    async fn test_run_writes_results_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path());
        let sink = MemorySink::new();
        scheduler.attach_sink(Box::new(sink.clone()));

        let summary = scheduler.run().await.unwrap();
        assert_eq!(summary.invocations, 3);
        assert_eq!(summary.blocked, 1);
        assert!(!summary.stopped);
        assert!(!scheduler.is_running());

        let verdicts: Vec<(String, Verdict)> = sink.rows().into_iter().map(|r| (r.no, r.result)).collect();
        assert_eq!(
            verdicts,
            vec![
                ("TC_ONCE".to_string(), Verdict::Pass),
                ("TC_BOOM".to_string(), Verdict::Block),
                ("TC_REPEAT".to_string(), Verdict::Pass),
            ]
        );
        assert!(sink.is_closed());

        let log = std::fs::read_to_string(summary.log_dir.join("Counter.log")).unwrap();
        assert!(log.contains("==========TC_ONCE=========="));
        assert!(log.contains("round 2/2"));
        let ledger = std::fs::read_to_string(summary.log_dir.join(COST_TIME_FILE)).unwrap();
        assert_eq!(ledger.lines().count(), 2);
        assert!(ledger.starts_with("TC_ONCE: "));
    }

    #[tokio::test]
    async fn test_deselected_cases_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path());
        scheduler.with_catalog(|catalog| catalog.set_selection([("Counter", "TC_ONCE")]));
        let summary = scheduler.run().await.unwrap();
        assert_eq!(summary.invocations, 1);
        assert!(scheduler.catalog().cases("Counter").unwrap()[0].cost_time.is_some());
    }

    #[tokio::test]
    async fn test_events_published() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let scheduler = scheduler(dir.path()).with_events(tx);
        scheduler.with_catalog(|catalog| catalog.set_selection([("Counter", "TC_ONCE")]));
        scheduler.run().await.unwrap();

        assert!(matches!(rx.recv().await, Some(SchedulerEvent::RunStarted { cases: 1, .. })));
        assert!(matches!(rx.recv().await, Some(SchedulerEvent::CaseStarted { .. })));
        assert!(matches!(rx.recv().await, Some(SchedulerEvent::CaseFinished { .. })));
        assert!(matches!(rx.recv().await, Some(SchedulerEvent::RunFinished { .. })));
    }

    #[tokio::test]
    async fn test_full_event_channel_does_not_stall_run() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let scheduler = scheduler(dir.path()).with_events(tx);

        let summary = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
            .await
            .expect("run stalled on a full event channel")
            .unwrap();
        assert_eq!(summary.invocations, 3);
        assert!(!scheduler.is_running());

        assert!(matches!(rx.recv().await, Some(SchedulerEvent::RunStarted { cases: 3, .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_circle_floor() {
        let scheduler = Scheduler::new(SchedulerSettings::default(), logger::shared());
        scheduler.set_circle(0);
        assert_eq!(scheduler.settings().circle, 1);
    }
}
