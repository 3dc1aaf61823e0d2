//! Case metadata and results

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Timestamp format of result rows
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Declaration of one case, written by the test-set author
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseSpec {
    /// Case number, also the dispatch key
    pub no: String,
    /// Display name; defaults to `no`
    pub name: Option<String>,
    /// What the case checks
    pub description: Option<String>,
    /// Bench setup required
    pub environment: Option<String>,
    /// Ordered steps
    pub test_steps: Vec<String>,
    /// Expected outcomes
    pub expect_result: Vec<String>,
    /// Expected duration in seconds
    pub expect_time: Option<f64>,
    /// Whether the case takes a repeat count
    pub repeatable: bool,
}

impl CaseSpec {
    /// Case with only a number
    pub fn new(no: &str) -> Self {
        Self {
            no: no.to_string(),
            ..Self::default()
        }
    }

    /// Set the display name
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Set the description
    #[must_use]
    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Set the environment
    #[must_use]
    pub fn environment(mut self, environment: &str) -> Self {
        self.environment = Some(environment.to_string());
        self
    }

    /// Append a step
    #[must_use]
    pub fn step(mut self, step: &str) -> Self {
        self.test_steps.push(step.to_string());
        self
    }

    /// Append an expected outcome
    #[must_use]
    pub fn expect(mut self, result: &str) -> Self {
        self.expect_result.push(result.to_string());
        self
    }

    /// Set the expected duration
    #[must_use]
    pub fn expect_time(mut self, seconds: f64) -> Self {
        self.expect_time = Some(seconds);
        self
    }

    /// Mark the case as taking a repeat count
    #[must_use]
    pub fn repeatable(mut self) -> Self {
        self.repeatable = true;
        self
    }
}

/// Registered case metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseMeta {
    /// Owning test set
    pub set: String,
    /// Case number
    pub no: String,
    /// Display name
    pub name: String,
    /// What the case checks
    pub description: Option<String>,
    /// Bench setup required
    pub environment: Option<String>,
    /// Ordered steps
    pub test_steps: Vec<String>,
    /// Expected outcomes
    pub expect_result: Vec<String>,
    /// Expected duration in seconds
    pub expect_time: Option<f64>,
    /// Whether the case takes a repeat count
    pub repeatable: bool,
    /// Duration of the last completed run
    pub cost_time: Option<Duration>,
}

impl CaseMeta {
    /// Metadata for `spec` inside test set `set`
    pub fn from_spec(set: &str, spec: &CaseSpec) -> Self {
        Self {
            set: set.to_string(),
            no: spec.no.clone(),
            name: spec.name.clone().unwrap_or_else(|| spec.no.clone()),
            description: spec.description.clone(),
            environment: spec.environment.clone(),
            test_steps: spec.test_steps.clone(),
            expect_result: spec.expect_result.clone(),
            expect_time: spec.expect_time,
            repeatable: spec.repeatable,
            cost_time: None,
        }
    }

    /// Steps as `1.first2.second`
    pub fn steps_text(&self) -> String {
        self.test_steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}.{}", i + 1, step))
            .collect()
    }

    /// Expected outcomes joined by two spaces
    pub fn expect_text(&self) -> String {
        self.expect_result.join("  ")
    }
}

/// Case verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// Passed
    Pass,
    /// Explicitly failed
    Fail,
    /// Raised an error
    Block,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
            Self::Block => write!(f, "BLOCK"),
        }
    }
}

/// One result row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    /// Owning test set
    pub set: String,
    /// Case number
    pub no: String,
    /// Display name
    pub name: String,
    /// Verdict
    pub result: Verdict,
    /// Wall-clock time, `%Y-%m-%d %H:%M:%S`
    pub time: String,
    /// Detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl CaseResult {
    /// Result row for `meta`, stamped now
    pub fn new(meta: &CaseMeta, result: Verdict, msg: Option<String>) -> Self {
        Self {
            set: meta.set.clone(),
            no: meta.no.clone(),
            name: meta.name.clone(),
            result,
            time: Local::now().format(TIME_FORMAT).to_string(),
            msg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_defaults_to_no() {
        let meta = CaseMeta::from_spec("AdvTest", &CaseSpec::new("TC_ADV_001"));
        assert_eq!(meta.name, "TC_ADV_001");
        assert!(!meta.repeatable);

        let named = CaseMeta::from_spec("AdvTest", &CaseSpec::new("TC_ADV_002").name("adv restart"));
        assert_eq!(named.name, "adv restart");
    }

    #[test]
    fn test_text_rendering() {
        let spec = CaseSpec::new("TC1").step("power on").step("scan").expect("found").expect("rssi ok");
        let meta = CaseMeta::from_spec("Set", &spec);
        assert_eq!(meta.steps_text(), "1.power on2.scan");
        assert_eq!(meta.expect_text(), "found  rssi ok");
    }

    #[test]
    fn test_result_row() {
        let meta = CaseMeta::from_spec("Set", &CaseSpec::new("TC1"));
        let row = CaseResult::new(&meta, Verdict::Block, Some("boom".into()));
        assert_eq!(row.time.len(), "2024-01-01 00:00:00".len());
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["result"], "BLOCK");
        assert_eq!(json["msg"], "boom");
    }
}
