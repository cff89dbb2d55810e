use super::{ConnectionStatus, HealthDetails, HealthProbe, HealthReport, INTEGRITY_OK};
use crate::logging::{sanitize_message, MAX_LOGGED_ERROR_CHARS};
use crate::model::clock::now_epoch_ms;
use crate::retry::RetryPolicy;
use crate::store::{StorageBackend, StoreError, StoreResult};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_HISTORY_LIMIT: usize = 20;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct HealthState {
    last: Option<HealthReport>,
    history: VecDeque<HealthReport>,
}

struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

struct PeriodicTask {
    signal: Arc<StopSignal>,
    thread: JoinHandle<()>,
}

pub struct HealthChecker<P: ?Sized + HealthProbe + 'static = dyn StorageBackend> {
    probe: Arc<P>,
    retry: RetryPolicy,
    history_limit: usize,
    poll_interval: Duration,
    state: Arc<Mutex<HealthState>>,
    periodic: Mutex<Option<PeriodicTask>>,
}

impl<P: ?Sized + HealthProbe + 'static> HealthChecker<P> {
    pub fn new(probe: Arc<P>) -> Self {
        Self {
            probe,
            retry: RetryPolicy::probe(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: Arc::new(Mutex::new(HealthState::default())),
            periodic: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit.max(1);
        self
    }

    /// Poll interval used by [`Self::wait_for_healthy`].
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Runs every probe once and records the report.
    pub fn check_health(&self) -> HealthReport {
        let report = run_check(self.probe.as_ref(), &self.retry);
        record(&self.state, report.clone(), self.history_limit);
        report
    }

    /// Starts background checks every `interval`, replacing a running loop.
    pub fn start_periodic_check(&self, interval: Duration) {
        self.stop_periodic_check();

        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let probe = Arc::clone(&self.probe);
        let retry = self.retry.clone();
        let state = Arc::clone(&self.state);
        let history_limit = self.history_limit;
        let loop_signal = Arc::clone(&signal);

        let spawned = thread::Builder::new()
            .name("chefmind-health".to_string())
            .spawn(move || loop {
                {
                    let mut stopped = loop_signal.stopped.lock();
                    if !*stopped {
                        loop_signal.wake.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        return;
                    }
                }
                let report = run_check(probe.as_ref(), &retry);
                record(&state, report, history_limit);
            });

        match spawned {
            Ok(thread) => {
                info!(
                    "event=health_periodic module=health status=started interval_ms={}",
                    interval.as_millis()
                );
                *self.periodic.lock() = Some(PeriodicTask { signal, thread });
            }
            Err(err) => error!(
                "event=health_periodic module=health status=error error={}",
                err
            ),
        }
    }

    /// Stops the background loop; no-op when none is running.
    pub fn stop_periodic_check(&self) {
        let Some(task) = self.periodic.lock().take() else {
            return;
        };
        *task.signal.stopped.lock() = true;
        task.signal.wake.notify_all();
        if task.thread.join().is_err() {
            error!("event=health_periodic module=health status=error error=worker_panicked");
        } else {
            info!("event=health_periodic module=health status=stopped");
        }
    }

    pub fn is_periodic_running(&self) -> bool {
        self.periodic.lock().is_some()
    }

    /// Polls until a check passes or `timeout` elapses.
    pub fn wait_for_healthy(&self, timeout: Duration) -> bool {
        let started_at = Instant::now();
        while started_at.elapsed() < timeout {
            if self.check_health().is_healthy {
                return true;
            }
            let remaining = timeout.saturating_sub(started_at.elapsed());
            thread::sleep(self.poll_interval.min(remaining));
        }
        warn!(
            "event=health_wait module=health status=timeout timeout_ms={}",
            timeout.as_millis()
        );
        false
    }

    pub fn last_report(&self) -> Option<HealthReport> {
        self.state.lock().last.clone()
    }

    /// Recorded reports, oldest first.
    pub fn history(&self) -> Vec<HealthReport> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn summary(&self) -> String {
        match self.last_report() {
            Some(report) => report.summary(),
            None => "No health check performed".to_string(),
        }
    }
}

impl<P: ?Sized + HealthProbe + 'static> Drop for HealthChecker<P> {
    fn drop(&mut self) {
        self.stop_periodic_check();
    }
}

fn record(state: &Mutex<HealthState>, report: HealthReport, history_limit: usize) {
    let mut state = state.lock();
    state.history.push_back(report.clone());
    while state.history.len() > history_limit {
        state.history.pop_front();
    }
    state.last = Some(report);
}

fn run_check<P: ?Sized + HealthProbe>(probe: &P, retry: &RetryPolicy) -> HealthReport {
    let started_at = Instant::now();
    let checked_at_ms = now_epoch_ms();
    let mut details = HealthDetails::default();

    let outcome = run_probes(probe, retry, &mut details);
    let response_time_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok(()) => {
            debug!(
                "event=health_check module=health status=ok duration_ms={}",
                response_time_ms
            );
            HealthReport {
                is_healthy: true,
                connection_status: ConnectionStatus::Connected,
                response_time_ms,
                checked_at_ms,
                details,
            }
        }
        Err((stage, err)) => {
            error!(
                "event=health_check module=health status=error probe={} duration_ms={} error={}",
                stage,
                response_time_ms,
                sanitize_message(&err.to_string(), MAX_LOGGED_ERROR_CHARS)
            );
            let connection_status = match err {
                StoreError::Closed => ConnectionStatus::Disconnected,
                _ => ConnectionStatus::Error,
            };
            details.error = Some(err.to_string());
            HealthReport {
                is_healthy: false,
                connection_status,
                response_time_ms,
                checked_at_ms,
                details,
            }
        }
    }
}

fn run_probes<P: ?Sized + HealthProbe>(
    probe: &P,
    retry: &RetryPolicy,
    details: &mut HealthDetails,
) -> Result<(), (&'static str, StoreError)> {
    fn stage<T>(name: &'static str, result: StoreResult<T>) -> Result<T, (&'static str, StoreError)> {
        result.map_err(|err| (name, err))
    }

    stage("connectivity", retry.execute(|| probe.probe_connectivity()))?;
    details.can_execute = true;

    stage("read", retry.execute(|| probe.probe_read()))?;
    details.can_read = true;

    stage("write", retry.execute(|| probe.probe_write()))?;
    details.can_write = true;

    let footprint = stage("storage", retry.execute(|| probe.probe_storage()))?;
    details.storage_bytes = Some(footprint.bytes);
    details.page_count = footprint.page_count;

    let integrity = stage("integrity", retry.execute(|| probe.probe_integrity()))?;
    details.integrity_check = Some(integrity.clone());
    if integrity != INTEGRITY_OK {
        return Err((
            "integrity",
            StoreError::InvalidData(format!("integrity check failed: {integrity}")),
        ));
    }

    Ok(())
}
