//! Run coordinator.
//!
//! [`RuleTester::test_rule`] drives one run through
//! `Idle -> Staged -> Running -> {Succeeded, Failed, Cancelled}` on a single
//! task: it consumes the process event stream, watches the live channel for
//! closure, and releases the staged rule exactly once when the run settles.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{AppConfig, EngineConfig};

use super::channel::LiveChannel;
use super::fs::{FileStore, LocalFileStore};
use super::invocation::Invocation;
use super::options::TestOptions;
use super::process::{ProcessEvent, ProcessRunner, TokioProcessRunner};
use super::relay::StreamRelay;
use super::run::{RunState, TestRun};
use super::staging::StagingStore;
use super::telemetry::{run_sampler, HostSampler, SysinfoSampler};
use super::{TestError, TestOutcome};

/// Builds a fresh host sampler for each live run.
pub type SamplerFactory = Arc<dyn Fn() -> Box<dyn HostSampler> + Send + Sync>;

pub struct RuleTester {
    engine: EngineConfig,
    staging: StagingStore,
    runner: Arc<dyn ProcessRunner>,
    samplers: SamplerFactory,
    telemetry_interval: Duration,
}

impl std::fmt::Debug for RuleTester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleTester")
            .field("engine", &self.engine)
            .field("staging", &self.staging)
            .field("runner", &self.runner)
            .field("telemetry_interval", &self.telemetry_interval)
            .finish_non_exhaustive()
    }
}

impl RuleTester {
    /// Production wiring: local filesystem, real subprocesses, `sysinfo`.
    pub async fn from_config(config: &AppConfig) -> Self {
        let files: Arc<dyn FileStore> = Arc::new(LocalFileStore);
        let staging = StagingStore::open(config.server.test_dir(), files).await;
        Self::new(config.engine.clone(), staging, Arc::new(TokioProcessRunner))
            .with_telemetry(config.telemetry.interval(), Arc::new(sysinfo_sampler))
    }

    pub fn new(engine: EngineConfig, staging: StagingStore, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            engine,
            staging,
            runner,
            samplers: Arc::new(sysinfo_sampler),
            telemetry_interval: Duration::from_secs(1),
        }
    }

    pub fn with_telemetry(mut self, interval: Duration, samplers: SamplerFactory) -> Self {
        self.telemetry_interval = interval;
        self.samplers = samplers;
        self
    }

    /// Test `rule` against the engine.
    ///
    /// Without a channel, a nonzero exit is an error carrying the engine's
    /// stderr. With a channel, output is streamed as it arrives, closing the
    /// channel kills the engine, and a nonzero exit settles as
    /// [`TestOutcome::Cancelled`].
    pub async fn test_rule(
        &self,
        rule: &str,
        options: &TestOptions,
        channel: Option<LiveChannel>,
    ) -> Result<TestOutcome, TestError> {
        let mut run = TestRun::new(StreamRelay::new(channel.clone()));
        let result = self.execute(&mut run, rule, options, channel).await;

        match &result {
            Ok(TestOutcome::Succeeded(_)) => info!(run_id = %run.id, "rule test succeeded"),
            Ok(TestOutcome::Cancelled { exit_code }) => info!(
                run_id = %run.id,
                exit_code = ?exit_code,
                cancelled = run.cancelled,
                "rule test ended without success"
            ),
            Err(e) => error!(run_id = %run.id, error = %e, "failed to test rule"),
        }
        result
    }

    async fn execute(
        &self,
        run: &mut TestRun,
        rule: &str,
        options: &TestOptions,
        channel: Option<LiveChannel>,
    ) -> Result<TestOutcome, TestError> {
        let staged = match self.staging.stage(rule).await {
            Ok(staged) => staged,
            Err(e) => {
                run.transition(RunState::Failed);
                return Err(e);
            }
        };
        run.staged_path = Some(staged.path().to_path_buf());
        run.transition(RunState::Staged);

        let result = self.drive(run, staged.path(), options, channel).await;

        staged.release().await;
        result
    }

    async fn drive(
        &self,
        run: &mut TestRun,
        rule_path: &Path,
        options: &TestOptions,
        channel: Option<LiveChannel>,
    ) -> Result<TestOutcome, TestError> {
        let invocation = Invocation::for_rule_test(&self.engine, rule_path, options);
        run.args = invocation.args.clone();
        debug!(run_id = %run.id, args = ?run.args, "launching engine");

        let mut process = match self.runner.spawn(&invocation) {
            Ok(process) => process,
            Err(e) => {
                error!(
                    run_id = %run.id,
                    path = %rule_path.display(),
                    error = %e,
                    "failed to start test"
                );
                run.transition(RunState::Failed);
                return Err(e);
            }
        };
        run.transition(RunState::Running);

        // Torn down when the process exits, or if this future is dropped.
        let sampler_stop = CancellationToken::new();
        let _sampler_guard = sampler_stop.clone().drop_guard();
        let sampler = channel.as_ref().map(|ch| {
            tokio::spawn(run_sampler(
                (self.samplers)(),
                ch.clone(),
                self.telemetry_interval,
                sampler_stop.clone(),
            ))
        });

        let exit_code = loop {
            tokio::select! {
                event = process.next_event() => match event {
                    Some(ProcessEvent::Stdout(chunk)) => run.relay.on_stdout(&chunk),
                    Some(ProcessEvent::Stderr(chunk)) => run.relay.on_stderr(&chunk),
                    Some(ProcessEvent::Exit(code)) => break code,
                    None => break None,
                },
                _ = wait_closed(channel.as_ref()), if !run.cancelled => {
                    info!(run_id = %run.id, "live channel closed, killing test process");
                    run.cancelled = true;
                    process.kill();
                }
            }
        };
        run.relay.finish();

        sampler_stop.cancel();
        if let Some(task) = sampler {
            if let Ok(sent) = task.await {
                debug!(run_id = %run.id, samples = sent, "telemetry stopped");
            }
        }

        if exit_code == Some(0) {
            run.transition(RunState::Succeeded);
            return Ok(TestOutcome::Succeeded(run.relay.transcript(options.format)));
        }

        if channel.is_some() {
            run.transition(RunState::Cancelled);
            return Ok(TestOutcome::Cancelled { exit_code });
        }

        run.transition(RunState::Failed);
        let stderr = run.relay.error_text();
        error!(run_id = %run.id, exit_code = ?exit_code, "{stderr}");
        Err(TestError::RuntimeFailure {
            code: exit_code,
            stderr,
        })
    }
}

fn sysinfo_sampler() -> Box<dyn HostSampler> {
    Box::new(SysinfoSampler::new())
}

async fn wait_closed(channel: Option<&LiveChannel>) {
    match channel {
        Some(channel) => channel.closed().await,
        None => std::future::pending().await,
    }
}
