//! Scheduled provider health monitoring.
//!
//! [`HealthMonitor`] probes every registered adapter on a fixed interval
//! and keeps one [`HealthRecord`] per provider. Probes run concurrently,
//! each in its own task and under its own timeout, so a hung or panicking
//! adapter is recorded as unhealthy instead of stalling the loop.
//!
//! A change between healthy and unhealthy broadcasts one [`HealthAlert`].
//! A provider without a record counts as healthy for transition purposes,
//! so its first failing probe alerts and its first passing probe does not.
//!
//! The monitor never gates the request path; callers consult it, e.g.
//! before a validated switch.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::providers::ProviderAdapter;
use crate::telemetry;
use crate::types::{HealthAlert, HealthCheckResult, HealthRecord, ProviderId};
use crate::{HeimdallError, Result};

/// Alerts buffered per subscriber before the slowest one starts lagging.
const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Scheduling parameters for the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    /// Time between probe rounds. Default: 60s.
    pub interval: Duration,
    /// Upper bound on a single probe. Default: 10s.
    pub check_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            check_timeout: Duration::from_secs(10),
        }
    }
}

impl HealthConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Both durations must be non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() || self.check_timeout.is_zero() {
            return Err(HeimdallError::InvalidConfiguration(format!(
                "health interval and check timeout must be > 0, got {:?} and {:?}",
                self.interval, self.check_timeout
            )));
        }
        Ok(())
    }
}

struct Running {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

struct Shared {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    records: RwLock<HashMap<ProviderId, HealthRecord>>,
    alerts: broadcast::Sender<HealthAlert>,
    config: HealthConfig,
}

/// Background health checker for a fixed set of adapters.
pub struct HealthMonitor {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl HealthMonitor {
    pub fn new(adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>, config: HealthConfig) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                adapters,
                records: RwLock::new(HashMap::new()),
                alerts,
                config,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> HealthConfig {
        self.shared.config
    }

    /// Spawn the scheduling loop. The first round runs immediately.
    /// Calling `start` on a running monitor is a no-op.
    pub fn start(&self) -> Result<()> {
        self.shared.config.validate()?;
        let mut running = self.running.lock().map_err(|e| {
            HeimdallError::InvalidConfiguration(format!("Failed to acquire monitor lock: {e}"))
        })?;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("health monitor already running");
            return Ok(());
        }

        let (shutdown, mut stop_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let interval = shared.config.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        shared.check_all().await;
                    }
                }
            }
            debug!("health monitor loop exited");
        });

        *running = Some(Running { handle, shutdown });
        info!(
            interval_secs = interval.as_secs_f64(),
            providers = self.shared.adapters.len(),
            "health monitor started"
        );
        Ok(())
    }

    /// Stop the scheduling loop and wait for it to exit. Recorded health
    /// state is kept.
    pub async fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(Running { handle, shutdown }) = running {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await
                && e.is_panic()
            {
                warn!(error = %e, "health monitor task panicked");
            }
            info!("health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        match self.running.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|r| !r.handle.is_finished()),
            Err(_) => false,
        }
    }

    /// Last record for a provider, `None` before its first probe.
    pub fn get_health_status(&self, provider: ProviderId) -> Option<HealthRecord> {
        self.shared.read_records().get(&provider).cloned()
    }

    /// Providers whose last recorded probe passed.
    pub fn get_healthy_providers(&self) -> Vec<ProviderId> {
        let mut healthy: Vec<ProviderId> = self
            .shared
            .read_records()
            .values()
            .filter(|r| r.is_healthy)
            .map(|r| r.provider)
            .collect();
        healthy.sort();
        healthy
    }

    pub fn get_all_health_status(&self) -> BTreeMap<ProviderId, HealthRecord> {
        self.shared
            .read_records()
            .iter()
            .map(|(p, r)| (*p, r.clone()))
            .collect()
    }

    /// Probe one provider (or all, with `None`) right now, outside the
    /// schedule. Returns the updated records.
    pub async fn force_health_check(&self, provider: Option<ProviderId>) -> Result<Vec<HealthRecord>> {
        match provider {
            Some(p) => {
                let adapter = self.shared.adapters.get(&p).cloned().ok_or_else(|| {
                    HeimdallError::InvalidConfiguration(format!("no adapter registered for {p}"))
                })?;
                let handle = tokio::spawn(probe(adapter, self.shared.config.check_timeout));
                Ok(vec![self.shared.apply(p, joined(handle).await)])
            }
            None => Ok(self.shared.check_all().await),
        }
    }

    /// Receive an alert for every healthy/unhealthy transition.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthAlert> {
        self.shared.alerts.subscribe()
    }

    pub fn providers(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self.shared.adapters.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        let running = match self.running.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(Running { handle, shutdown }) = running {
            let _ = shutdown.send(true);
            handle.abort();
        }
    }
}

impl Shared {
    fn read_records(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ProviderId, HealthRecord>> {
        match self.records.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// One probe round over every adapter, concurrently.
    async fn check_all(&self) -> Vec<HealthRecord> {
        let timeout = self.config.check_timeout;
        let mut ids: Vec<ProviderId> = self.adapters.keys().copied().collect();
        ids.sort();

        let probes: Vec<(ProviderId, JoinHandle<HealthCheckResult>)> = ids
            .into_iter()
            .filter_map(|p| {
                let adapter = Arc::clone(self.adapters.get(&p)?);
                Some((p, tokio::spawn(probe(adapter, timeout))))
            })
            .collect();

        let mut records = Vec::with_capacity(probes.len());
        for (provider, handle) in probes {
            records.push(self.apply(provider, joined(handle).await));
        }
        records
    }

    /// Fold one probe result into the provider's record, alerting on a
    /// transition.
    fn apply(&self, provider: ProviderId, result: HealthCheckResult) -> HealthRecord {
        let (record, was_healthy) = {
            let mut records = match self.records.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entry = records.entry(provider).or_insert_with(|| HealthRecord {
                provider,
                is_healthy: true,
                consecutive_failures: 0,
                last_error: None,
                last_latency: None,
                last_checked: Instant::now(),
            });
            let was_healthy = entry.is_healthy;

            entry.last_checked = Instant::now();
            entry.last_latency = Some(result.latency);
            if result.available {
                entry.is_healthy = true;
                entry.consecutive_failures = 0;
                entry.last_error = None;
            } else {
                entry.is_healthy = false;
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.last_error = Some(
                    result
                        .error
                        .unwrap_or_else(|| "reported unavailable".to_string()),
                );
            }
            (entry.clone(), was_healthy)
        };

        let status = if record.is_healthy { "healthy" } else { "unhealthy" };
        metrics::counter!(telemetry::HEALTH_CHECKS_TOTAL,
            "provider" => provider.as_str(),
            "status" => status,
        )
        .increment(1);

        if was_healthy != record.is_healthy {
            if record.is_healthy {
                info!(provider = %provider, "provider recovered");
            } else {
                warn!(
                    provider = %provider,
                    consecutive_failures = record.consecutive_failures,
                    error = record.last_error.as_deref().unwrap_or(""),
                    "provider became unhealthy"
                );
            }
            metrics::counter!(telemetry::HEALTH_TRANSITIONS_TOTAL,
                "provider" => provider.as_str(),
                "status" => status,
            )
            .increment(1);
            // No subscribers is fine.
            let _ = self.alerts.send(HealthAlert {
                provider,
                healthy: record.is_healthy,
                consecutive_failures: record.consecutive_failures,
                error: record.last_error.clone(),
            });
        } else {
            debug!(provider = %provider, healthy = record.is_healthy, "health check");
        }

        record
    }
}

/// Await a spawned probe; a panicked or cancelled probe counts as a failure.
async fn joined(handle: JoinHandle<HealthCheckResult>) -> HealthCheckResult {
    handle.await.unwrap_or_else(|e| {
        HealthCheckResult::unhealthy(Duration::ZERO, format!("health check aborted: {e}"))
    })
}

/// Run one adapter probe under a deadline.
async fn probe(adapter: Arc<dyn ProviderAdapter>, timeout: Duration) -> HealthCheckResult {
    match tokio::time::timeout(timeout, adapter.health_check()).await {
        Ok(result) => result,
        Err(_) => HealthCheckResult::unhealthy(
            timeout,
            format!("health check timed out after {}ms", timeout.as_millis()),
        ),
    }
}
