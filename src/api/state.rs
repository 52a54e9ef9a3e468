use std::sync::Arc;

use crate::ruletest::RuleTester;
use crate::silence::SilenceRegistry;

/// Shared state for all handlers, built once per server instance.
#[derive(Debug, Clone)]
pub struct AppState {
    pub tester: Arc<RuleTester>,
    pub silences: Arc<SilenceRegistry>,
}

impl AppState {
    pub fn new(tester: RuleTester, silences: SilenceRegistry) -> Self {
        Self {
            tester: Arc::new(tester),
            silences: Arc::new(silences),
        }
    }
}
