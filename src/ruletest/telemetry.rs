//! Host telemetry for live test observers.
//!
//! While a live channel is attached, a sampler task sends a `stats` event on
//! a fixed cadence until the channel closes or the run tells it to stop.

use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::channel::{LiveChannel, StreamEvent};

/// CPU and memory utilization, both in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub cpu: f64,
    pub mem: f64,
}

/// Source of host samples.
pub trait HostSampler: Send {
    fn sample(&mut self) -> Result<TelemetrySample>;
}

/// [`HostSampler`] backed by `sysinfo`.
///
/// CPU usage is computed between consecutive refreshes, so the instance is
/// kept for the lifetime of one sampler task.
pub struct SysinfoSampler {
    sys: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        Self { sys }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler for SysinfoSampler {
    fn sample(&mut self) -> Result<TelemetrySample> {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let total = self.sys.total_memory();
        if total == 0 {
            bail!("total memory reported as zero");
        }
        let free = self.sys.free_memory().min(total);
        let mem = (total - free) as f64 / total as f64 * 100.0;

        let cpu = f64::from(self.sys.global_cpu_usage());
        if !cpu.is_finite() {
            bail!("cpu usage not available yet");
        }

        Ok(TelemetrySample { cpu, mem })
    }
}

/// Send host stats to `channel` every `interval` until the channel is
/// observed closed or `stop` is cancelled. Returns the number of samples sent.
pub async fn run_sampler(
    mut sampler: Box<dyn HostSampler>,
    channel: LiveChannel,
    interval: Duration,
    stop: CancellationToken,
) -> u64 {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent = 0u64;

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => break,

            _ = ticker.tick() => {
                if !channel.is_open() {
                    debug!("live channel closed, stopping telemetry");
                    break;
                }
                match sampler.sample() {
                    Ok(sample) => {
                        if !channel.send(&StreamEvent::Stats(sample)) {
                            break;
                        }
                        sent += 1;
                    }
                    Err(e) => warn!(error = %e, "failed to sample host stats, skipping tick"),
                }
            }
        }
    }

    sent
}


#[cfg(test)]
mod tests {
    use super::fake::FixedSampler;
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_sysinfo_sampler_reports_percentages() {
        let mut sampler = SysinfoSampler::new();
        let sample = sampler.sample().unwrap();

        assert!(sample.mem > 0.0 && sample.mem <= 100.0);
        assert!(sample.cpu >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_once_per_interval_until_stopped() {
        let (channel, mut rx) = LiveChannel::new();
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_sampler(
            Box::new(FixedSampler::default()),
            channel,
            Duration::from_secs(1),
            stop.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        stop.cancel();
        let sent = task.await.unwrap();

        assert_eq!(sent, 3);
        let first = rx.recv().await.unwrap();
        assert_eq!(first, r#"{"event":"stats","data":{"cpu":25.0,"mem":50.0}}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_samples_are_skipped() {
        let (channel, _rx) = LiveChannel::new();
        let stop = CancellationToken::new();
        let sampler = FixedSampler {
            flaky: true,
            ..FixedSampler::default()
        };
        let calls = sampler.calls.clone();
        let task = tokio::spawn(run_sampler(
            Box::new(sampler),
            channel,
            Duration::from_secs(1),
            stop.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(4500)).await;
        stop.cancel();
        let sent = task.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_channel_closes() {
        let (channel, _rx) = LiveChannel::new();
        let sampler = FixedSampler::default();
        let calls = sampler.calls.clone();
        let task = tokio::spawn(run_sampler(
            Box::new(sampler),
            channel.clone(),
            Duration::from_secs(1),
            CancellationToken::new(),
        ));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        channel.close();

        let sent = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("sampler should stop on its own")
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
