//! Engine command line for one rule test.

use std::path::{Path, PathBuf};

use crate::config::EngineConfig;

use super::options::TestOptions;

/// A fully derived subprocess invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl Invocation {
    /// Build `python3 -m elastalert.test_rule --config config.yaml <rule> ...`.
    pub fn for_rule_test(engine: &EngineConfig, rule_path: &Path, options: &TestOptions) -> Self {
        let mut args = vec![
            "-m".to_string(),
            engine.module.clone(),
            "--config".to_string(),
            engine.config_file.clone(),
            rule_path.to_string_lossy().into_owned(),
        ];
        args.extend(options.to_args());

        Self {
            program: engine.python.clone(),
            args,
            cwd: engine.path.clone(),
        }
    }
}
