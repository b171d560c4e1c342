//! Background health monitoring.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use afcp_admission::AdmissionController;
use afcp_metrics::FederationMetrics;
use afcp_primitives::Clock;
use afcp_registry::{Registry, TickPolicy};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::HealthConfig;

/// Periodic maintenance task: offline aging, load decay, admission GC.
///
/// The monitor runs independently of traffic and never fails the process;
/// anything noteworthy is logged and the loop carries on.
pub(crate) struct HealthMonitor {
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub(crate) fn spawn(
        registry: Arc<Registry>,
        admission: Arc<AdmissionController>,
        metrics: Arc<FederationMetrics>,
        clock: Arc<dyn Clock>,
        config: HealthConfig,
        gc_interval: Duration,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let worker = tokio::spawn(async move {
            run_monitor_loop(registry, admission, metrics, clock, config, gc_interval, flag).await;
        });
        Self {
            shutdown,
            worker: Some(worker),
        }
    }

    pub(crate) fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_monitor_loop(
    registry: Arc<Registry>,
    admission: Arc<AdmissionController>,
    metrics: Arc<FederationMetrics>,
    clock: Arc<dyn Clock>,
    config: HealthConfig,
    gc_interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let policy = TickPolicy {
        offline_threshold: config.offline_threshold,
        decay_factor: config.load_decay_factor,
        decay_bias: config.load_decay_bias,
    };

    let mut interval = tokio::time::interval(config.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_gc = clock.now();

    loop {
        interval.tick().await;
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let summary = registry.tick(&policy);
        metrics.record_tick_loads(&summary.load_values);
        if summary.went_offline > 0 {
            warn!(
                went_offline = summary.went_offline,
                "agents aged out to offline"
            );
        }
        debug!(
            active = summary.active,
            degraded = summary.degraded,
            offline = summary.offline,
            "health tick"
        );

        let now = clock.now();
        if now.saturating_sub(last_gc) >= gc_interval {
            admission.gc();
            last_gc = now;
        }
    }
}
