//! Typed test options and their wire form.

use serde::{Deserialize, Serialize};

use super::TestError;

/// Which part of the rule the engine should exercise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestType {
    /// Full run: schema check, query, and match counting.
    #[default]
    #[serde(rename = "all", alias = "full")]
    All,
    #[serde(rename = "schemaOnly")]
    SchemaOnly,
    #[serde(rename = "countOnly")]
    CountOnly,
}

/// Shape of the engine's stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable transcript.
    #[default]
    Plain,
    /// One structured JSON document (`--formatted-output`).
    Json,
}

/// Query window. An explicit range always wins over a day count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeWindow {
    Range { start: String, end: String },
    Days(u32),
}

/// Immutable description of how a rule test is run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOptions {
    pub window: TimeWindow,
    pub format: OutputFormat,
    /// Upper bound on documents the engine fetches; `0` leaves the engine default.
    pub max_results: u64,
    /// Actually fire the rule's alert actions.
    pub alert: bool,
    pub test_type: TestType,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            window: TimeWindow::Days(DEFAULT_DAYS),
            format: OutputFormat::Plain,
            max_results: 0,
            alert: false,
            test_type: TestType::All,
        }
    }
}

const DEFAULT_DAYS: u32 = 1;

/// Loosely shaped options as sent by clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TestOptionsRequest {
    pub start: Option<String>,
    pub end: Option<String>,
    pub days: Option<u32>,
    pub format: OutputFormat,
    pub max_results: u64,
    pub alert: bool,
    pub test_type: TestType,
}

impl TryFrom<TestOptionsRequest> for TestOptions {
    type Error = TestError;

    fn try_from(req: TestOptionsRequest) -> Result<Self, Self::Error> {
        let window = match (req.start, req.end) {
            (Some(start), Some(end)) if !start.is_empty() && !end.is_empty() => {
                TimeWindow::Range { start, end }
            }
            _ => {
                let days = req.days.unwrap_or(DEFAULT_DAYS);
                if days == 0 {
                    return Err(TestError::InvalidOptions(
                        "days must be at least 1".to_string(),
                    ));
                }
                TimeWindow::Days(days)
            }
        };

        Ok(TestOptions {
            window,
            format: req.format,
            max_results: req.max_results,
            alert: req.alert,
            test_type: req.test_type,
        })
    }
}

impl TestOptions {
    /// Option flags appended after the fixed engine prefix.
    ///
    /// The order is significant to the engine's CLI and must not change.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        match &self.window {
            TimeWindow::Range { start, end } => {
                args.push("--start".to_string());
                args.push(start.clone());
                args.push("--end".to_string());
                args.push(end.clone());
            }
            TimeWindow::Days(days) => {
                args.push("--days".to_string());
                args.push(days.to_string());
            }
        }

        if self.format == OutputFormat::Json {
            args.push("--formatted-output".to_string());
        }

        if self.max_results > 0 {
            args.push("--max-query-size".to_string());
            args.push(self.max_results.to_string());
        }

        if self.alert {
            args.push("--alert".to_string());
        }

        match self.test_type {
            TestType::SchemaOnly => args.push("--schema-only".to_string()),
            TestType::CountOnly => args.push("--count-only".to_string()),
            TestType::All => {}
        }

        args
    }
}
