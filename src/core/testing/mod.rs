//! Test framework
//!
//! - [`case`]: case metadata and result rows
//! - [`suite`]: test-set trait, registration and the execution wrapper
//! - [`catalog`]: full catalog plus the selected subset
//! - [`report`]: result-sink contract and reference sinks

pub mod case;
pub mod catalog;
pub mod report;
pub mod suite;

pub use case::{CaseMeta, CaseResult, CaseSpec, Verdict, TIME_FORMAT};
pub use catalog::CaseCatalog;
pub use report::{JsonLinesSink, MemorySink, Reporter, ResultSink};
pub use suite::{
    execute_case, CaseContext, CaseOutcome, SuiteError, TestRegistry, TestSet, TestSetDef, TestSetFactory, STATUS_OK,
};
