//! Test sets and case execution
//!
//! A test set is registered with a factory and its case declarations. The
//! scheduler instantiates the set against the device group and runs each
//! selected case through [`execute_case`], which turns any error or panic
//! into a BLOCK row instead of letting it reach the scheduler.

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::case::{CaseMeta, CaseResult, CaseSpec, Verdict};
use super::report::Reporter;
use crate::core::device::{CallOptions, DeviceGroup};
use crate::core::logger::TrafficLog;
use crate::core::protocol::Decoded;

/// Expected status of a successful command
pub const STATUS_OK: &[u8] = &[0x00, 0x00];

/// Test registration errors
#[derive(Error, Debug)]
pub enum SuiteError {
    /// Two test sets share a name
    #[error("Duplicate test set: {0}")]
    DuplicateSet(String),

    /// Two cases of one set share a number
    #[error("Duplicate case {no} in test set {set}")]
    DuplicateCase {
        /// Test set
        set: String,
        /// Case number
        no: String,
    },
}

/// A collection of cases sharing setup and state
#[async_trait]
pub trait TestSet: Send {
    /// Runs before every case
    async fn setup(&mut self, _ctx: &mut CaseContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Run the case numbered `case_no`
    async fn run(&mut self, case_no: &str, ctx: &mut CaseContext) -> anyhow::Result<()>;
}

/// Builds a test set for a device group
pub type TestSetFactory = Arc<dyn Fn(&DeviceGroup) -> Box<dyn TestSet> + Send + Sync>;

/// Registration record of one test set
#[derive(Clone)]
pub struct TestSetDef {
    name: String,
    cases: Vec<CaseSpec>,
    factory: TestSetFactory,
}

impl std::fmt::Debug for TestSetDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestSetDef")
            .field("name", &self.name)
            .field("cases", &self.cases.len())
            .finish_non_exhaustive()
    }
}

impl TestSetDef {
    /// Definition with no cases yet
    pub fn new<F>(name: &str, factory: F) -> Self
    where
        F: Fn(&DeviceGroup) -> Box<dyn TestSet> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            cases: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    /// Declare a case
    #[must_use]
    pub fn case(mut self, spec: CaseSpec) -> Self {
        self.cases.push(spec);
        self
    }

    /// Set name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Case metadata in declaration order
    pub fn cases(&self) -> Vec<CaseMeta> {
        self.cases.iter().map(|spec| CaseMeta::from_spec(&self.name, spec)).collect()
    }

    /// Instantiate against `devices`
    pub fn instantiate(&self, devices: &DeviceGroup) -> Box<dyn TestSet> {
        (self.factory)(devices)
    }
}

/// Every known test set, in registration order
#[derive(Debug, Clone, Default)]
pub struct TestRegistry {
    sets: Vec<TestSetDef>,
}

impl TestRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a set
    pub fn add(&mut self, def: TestSetDef) -> Result<(), SuiteError> {
        if self.get(&def.name).is_some() {
            return Err(SuiteError::DuplicateSet(def.name));
        }
        let mut seen = HashSet::new();
        for spec in &def.cases {
            if !seen.insert(spec.no.as_str()) {
                return Err(SuiteError::DuplicateCase {
                    set: def.name.clone(),
                    no: spec.no.clone(),
                });
            }
        }
        self.sets.push(def);
        Ok(())
    }

    /// Look up a set
    pub fn get(&self, name: &str) -> Option<&TestSetDef> {
        self.sets.iter().find(|def| def.name == name)
    }

    /// Iterate in registration order
    pub fn iter(&self) -> impl Iterator<Item = &TestSetDef> {
        self.sets.iter()
    }

    /// Number of sets
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// What a running case can reach
pub struct CaseContext {
    devices: DeviceGroup,
    reporter: Reporter,
    traffic: TrafficLog,
    meta: CaseMeta,
    circle: Option<u32>,
    reset_operation: Option<String>,
    recorded: usize,
}

impl CaseContext {
    /// Context for one invocation of `meta`
    pub fn new(devices: DeviceGroup, reporter: Reporter, traffic: TrafficLog, meta: CaseMeta) -> Self {
        Self {
            devices,
            reporter,
            traffic,
            meta,
            circle: None,
            reset_operation: None,
            recorded: 0,
        }
    }

    /// Repeat count handed to a repeatable case; the case loops itself
    #[must_use]
    pub fn with_circle(mut self, circle: u32) -> Self {
        self.circle = Some(circle);
        self
    }

    /// Operation called on every device after a case errors
    #[must_use]
    pub fn with_reset(mut self, operation: Option<String>) -> Self {
        self.reset_operation = operation;
        self
    }

    /// Devices under test
    pub fn devices(&self) -> &DeviceGroup {
        &self.devices
    }

    /// Metadata of the running case
    pub fn meta(&self) -> &CaseMeta {
        &self.meta
    }

    /// Requested repeat count, for repeatable cases
    pub fn circle(&self) -> Option<u32> {
        self.circle
    }

    /// Rows recorded so far in this invocation
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    /// Write a note to the traffic log
    pub fn log(&self, message: &str) {
        tracing::info!(set = %self.meta.set, no = %self.meta.no, "{}", message);
        self.traffic.lock().log_info(message);
    }

    /// Record PASS or FAIL
    pub fn save_result(&mut self, pass: bool, msg: Option<&str>) {
        let verdict = if pass { Verdict::Pass } else { Verdict::Fail };
        self.record(verdict, msg.map(str::to_string));
    }

    /// Record PASS
    pub fn pass(&mut self) {
        self.save_result(true, None);
    }

    /// Record FAIL
    pub fn fail(&mut self, msg: &str) {
        self.save_result(false, Some(msg));
    }

    /// Record FAIL unless `value` is a status equal to `expected`
    /// (`0000` when `None`); returns whether it matched
    pub fn check_status(&mut self, value: Option<&Decoded>, msg: &str, expected: Option<&[u8]>) -> bool {
        let expected = expected.unwrap_or(STATUS_OK);
        match value.and_then(Decoded::as_status) {
            Some(status) if status.is(expected) => true,
            Some(status) => {
                self.fail(&format!("{},errcode:{}", msg, status.code));
                false
            }
            None => {
                let got = value.map(ToString::to_string).unwrap_or_else(|| "none".into());
                self.fail(&format!("{},errcode:{}", msg, got));
                false
            }
        }
    }

    fn record(&mut self, verdict: Verdict, msg: Option<String>) {
        let row = CaseResult::new(&self.meta, verdict, msg);
        self.traffic
            .lock()
            .log_info(&serde_json::to_string(&row).unwrap_or_default());
        self.reporter.emit(&row);
        self.recorded += 1;
    }
}

/// Outcome of one invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CaseOutcome {
    /// Duration, when the case completed without error
    pub cost_time: Option<Duration>,
    /// Error message, when the case was blocked
    pub error: Option<String>,
}

fn marker(text: &str) -> String {
    let bar = "=".repeat(10);
    format!("{bar}{text}{bar}")
}

/// Run one case invocation with markers, timing and error containment
///
/// A body that completes without recording anything counts as PASS.
pub async fn execute_case(set: &mut dyn TestSet, ctx: &mut CaseContext) -> CaseOutcome {
    let no = ctx.meta.no.clone();
    ctx.log(&marker(&no));
    let start = Instant::now();

    let body = async {
        set.setup(ctx).await?;
        set.run(&no, ctx).await
    };
    let result = match AssertUnwindSafe(body).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "case panicked".into());
            Err(anyhow::anyhow!(msg))
        }
    };

    match result {
        Ok(()) => {
            let cost = start.elapsed();
            ctx.meta.cost_time = Some(cost);
            if ctx.recorded == 0 {
                ctx.pass();
            }
            ctx.log(&marker(&format!("end, cost: {}s", cost.as_secs_f64())));
            CaseOutcome {
                cost_time: Some(cost),
                error: None,
            }
        }
        Err(e) => {
            tracing::error!(set = %ctx.meta.set, no = %no, error = ?e, "Case blocked");
            ctx.log(&format!("{:?}", e));
            ctx.record(Verdict::Block, Some(e.to_string()));
            best_effort_reset(ctx).await;
            CaseOutcome {
                cost_time: None,
                error: Some(e.to_string()),
            }
        }
    }
}

async fn best_effort_reset(ctx: &CaseContext) {
    let Some(operation) = ctx.reset_operation.as_deref() else {
        return;
    };
    let results = ctx
        .devices
        .call_all(operation, &json!({}), CallOptions::default())
        .await;
    for (device, result) in ctx.devices.iter().zip(results) {
        if let Err(e) = result {
            tracing::warn!(device = %device.label(), error = %e, "Reset after error failed");
        }
    }
}
