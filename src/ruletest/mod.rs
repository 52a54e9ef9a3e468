//! Rule-test execution pipeline.
//!
//! A rule body is staged to disk, the ElastAlert test module is launched
//! against it as a subprocess, and its output is relayed to an optional live
//! observer together with host telemetry. The [`RuleTester`] ties the parts
//! together and owns cleanup.

pub mod channel;
pub mod coordinator;
pub mod fs;
pub mod invocation;
pub mod options;
pub mod process;
pub mod relay;
pub mod run;
pub mod staging;
pub mod telemetry;

use thiserror::Error;

pub use channel::{LiveChannel, StreamEvent};
pub use coordinator::RuleTester;
pub use options::{OutputFormat, TestOptions, TestOptionsRequest, TestType, TimeWindow};
pub use run::RunState;
pub use telemetry::TelemetrySample;

#[derive(Debug, Error)]
pub enum TestError {
    #[error("invalid test options: {0}")]
    InvalidOptions(String),

    #[error("failed to stage rule: {0:#}")]
    Staging(#[source] anyhow::Error),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine exited nonzero. Displays as the engine's stderr.
    #[error("{stderr}")]
    RuntimeFailure { code: Option<i32>, stderr: String },
}

/// How a run settled, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    /// Exit code 0; the engine's stdout in the requested format.
    Succeeded(String),
    /// Nonzero exit while a live observer was attached. The observer has
    /// already seen the output, so this is not reported as an error.
    Cancelled { exit_code: Option<i32> },
}
