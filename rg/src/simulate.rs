//! Synthetic workload against a fake throttling backend

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use eyre::Result;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::error::StatusError;
use crate::scheduler::{Scheduler, SchedulerStats, SubmitOptions};

/// Stand-in for a remote API that sometimes answers 429
#[derive(Debug)]
pub struct FakeBackend {
    latency: Duration,
    throttle_probability: f64,
    calls: AtomicU64,
    throttled: AtomicU64,
}

impl FakeBackend {
    pub fn new(latency: Duration, throttle_probability: f64) -> Self {
        Self {
            latency,
            throttle_probability: throttle_probability.clamp(0.0, 1.0),
            calls: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        }
    }

    pub async fn call(&self, resource: &str) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let throttle = rand::rng().random_bool(self.throttle_probability);
        tokio::time::sleep(self.latency).await;

        if throttle {
            self.throttled.fetch_add(1, Ordering::SeqCst);
            debug!(%resource, call, "FakeBackend::call: throttling");
            return Err(StatusError::too_many_requests(format!("Too many requests for {}", resource)).into());
        }
        Ok(format!("{} (call {})", resource, call))
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::SeqCst)
    }
}

/// Outcome of one simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub requests: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub backend_calls: u64,
    pub throttled_responses: u64,
    pub elapsed_ms: u64,
    pub stats: SchedulerStats,
}

/// Submit the configured workload and wait for every request to settle
pub async fn run_simulation(scheduler: &Scheduler, config: &SimulationConfig) -> Result<SimulationReport> {
    info!(?config, "Starting simulation");
    config.validate()?;

    let backend = Arc::new(FakeBackend::new(Duration::from_millis(config.work_ms), config.throttle_probability));
    let started = Instant::now();

    let pending: Vec<_> = (0..config.requests)
        .map(|i| {
            let resource = match config.distinct_keys {
                0 => format!("resource-{}", i),
                keys => format!("resource-{}", i % keys),
            };
            let mut options = SubmitOptions::new().with_priority(if i % 5 == 0 { 1 } else { 0 });
            if config.distinct_keys > 0 {
                options = options.with_key(resource.clone());
            }

            let backend = backend.clone();
            scheduler.submit(
                move || {
                    let backend = backend.clone();
                    let resource = resource.clone();
                    async move { backend.call(&resource).await }
                },
                options,
            )
        })
        .collect();

    let results = futures::future::join_all(pending).await;
    let succeeded = results.iter().filter(|r| r.is_ok()).count();

    let report = SimulationReport {
        requests: config.requests,
        succeeded,
        failed: results.len() - succeeded,
        backend_calls: backend.calls(),
        throttled_responses: backend.throttled(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        stats: scheduler.stats(),
    };
    info!(succeeded = report.succeeded, failed = report.failed, "Simulation finished");
    Ok(report)
}
