//! Service orchestration
//!
//! Launches the trading services as child processes in priority order,
//! tracks their health through PID files and heartbeats, restarts crashed
//! services with exponential backoff, and coordinates graceful shutdown.
//! The pre-market scanner is launched on schedule inside its ET window
//! whenever today's watchlist is missing.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, Signal, System};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::services::{et_now, sleep_interruptible, within_et_window};
use crate::state::StateDir;

/// Seconds between supervision passes
const SUPERVISION_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period for a service to settle in-flight orders before SIGKILL
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Restart backoff bounds: 1s doubling to 60s, reset after 5min stability
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const STABILITY_RESET: Duration = Duration::from_secs(300);

/// Lifecycle state of one supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Crashed,
    Stopping,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Stopped => "STOPPED",
            ServiceState::Starting => "STARTING",
            ServiceState::Running => "RUNNING",
            ServiceState::Crashed => "CRASHED",
            ServiceState::Stopping => "STOPPING",
        };
        f.write_str(s)
    }
}

/// Status document written to orchestrator_status.json
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceStatusEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusEntry {
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub heartbeat_age_seconds: Option<i64>,
}

struct ManagedService {
    name: &'static str,
    /// Lower value starts first (the seller must never be the casualty)
    priority: u8,
    interval_seconds: u64,
    child: Option<Child>,
    consecutive_failures: u32,
    restart_at: Option<Instant>,
    started_at: Option<Instant>,
}

impl ManagedService {
    fn new(name: &'static str, priority: u8, interval_seconds: u64) -> Self {
        Self {
            name,
            priority,
            interval_seconds,
            child: None,
            consecutive_failures: 0,
            restart_at: None,
            started_at: None,
        }
    }

    fn backoff(&self) -> Duration {
        let exp = self.consecutive_failures.saturating_sub(1).min(6);
        (BACKOFF_INITIAL * 2u32.pow(exp)).min(BACKOFF_CAP)
    }
}

/// Supervises the five trading services
pub struct Orchestrator {
    config: Config,
    state: StateDir,
    state_dir_arg: PathBuf,
    services: Vec<ManagedService>,
}

impl Orchestrator {
    pub fn new(config: Config, state: StateDir) -> Self {
        let state_dir_arg = state.root().to_path_buf();
        let services = vec![
            ManagedService::new("seller", 1, config.seller.interval_seconds),
            ManagedService::new("buyer", 2, config.buyer.interval_seconds),
            ManagedService::new("monitor", 2, config.monitor.interval_seconds),
            ManagedService::new("scanner", 3, config.scanner.interval_seconds),
        ];
        Self {
            config,
            state,
            state_dir_arg,
            services,
        }
    }

    fn spawn(&self, name: &str) -> Result<Child> {
        let exe = std::env::current_exe().context("Cannot locate own executable")?;
        let child = Command::new(exe)
            .arg(format!("run-{name}"))
            .arg("--state-dir")
            .arg(&self.state_dir_arg)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {name}"))?;

        let pid_path = self.state.pid_path(name);
        fs::write(&pid_path, child.id().to_string())
            .with_context(|| format!("Failed to write {}", pid_path.display()))?;

        Ok(child)
    }

    fn start_service(&mut self, index: usize) -> bool {
        let name = self.services[index].name;
        info!("Starting {name}...");

        match self.spawn(name) {
            Ok(child) => {
                let pid = child.id();
                self.services[index].child = Some(child);
                self.services[index].started_at = Some(Instant::now());

                // Brief settle check: an immediate exit is a failed start
                std::thread::sleep(Duration::from_secs(1));
                if let Some(child) = self.services[index].child.as_mut() {
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            error!("{name} exited immediately ({status})");
                            self.services[index].child = None;
                            return false;
                        }
                        Ok(None) => {
                            info!("{name} started (PID {pid})");
                            return true;
                        }
                        Err(e) => {
                            error!("{name} status check failed: {e}");
                            return false;
                        }
                    }
                }
                false
            }
            Err(e) => {
                error!("Failed to start {name}: {e:#}");
                false
            }
        }
    }

    /// Launch all services in priority order
    pub fn start_all(&mut self) -> Result<()> {
        info!("Starting all trading services");

        let mut order: Vec<usize> = (0..self.services.len()).collect();
        order.sort_by_key(|&i| self.services[i].priority);

        let mut started = 0;
        for i in order {
            if self.start_service(i) {
                started += 1;
            }
        }

        self.write_status()?;

        if started == self.services.len() {
            info!("All {} services started", started);
            Ok(())
        } else {
            anyhow::bail!("only {started}/{} services started", self.services.len())
        }
    }

    /// Gracefully stop every service found via PID files: SIGTERM, wait
    /// out the order-settling grace period, then force-kill stragglers.
    pub fn stop_all(&mut self) -> Result<()> {
        info!("Stopping all trading services");

        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );

        for service in &mut self.services {
            // Children spawned by this process
            if let Some(mut child) = service.child.take() {
                let pid = child.id();
                terminate_pid(&system, pid, service.name);
                let _ = child.wait();
            }
        }

        // PID files may refer to services started by an earlier orchestrator
        for name in crate::services::SERVICE_NAMES {
            let pid_path = self.state.pid_path(name);
            if let Some(pid) = read_pid(&pid_path) {
                if process_alive(&system, pid) {
                    terminate_pid(&system, pid, name);
                }
                let _ = fs::remove_file(&pid_path);
            }
        }

        self.write_status()?;
        info!("All services stopped");
        Ok(())
    }

    /// Report per-service health. Running requires a live PID and a
    /// heartbeat fresher than twice the service interval.
    pub fn status(&mut self) -> Result<OrchestratorStatus> {
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        let now = Utc::now();
        let mut doc = OrchestratorStatus {
            timestamp: Some(now),
            services: BTreeMap::new(),
        };

        for service in &self.services {
            let pid_path = self.state.pid_path(service.name);
            let pid = read_pid(&pid_path);
            let alive = pid.map(|p| process_alive(&system, p)).unwrap_or(false);
            let heartbeat_age = self.state.heartbeat_age_seconds(service.name, now);

            let state = match (pid, alive) {
                (Some(_), true) => {
                    let fresh = heartbeat_age
                        .map(|age| age <= 2 * service.interval_seconds as i64)
                        .unwrap_or(false);
                    if fresh {
                        ServiceState::Running
                    } else {
                        ServiceState::Starting
                    }
                }
                (Some(_), false) => {
                    // Stale PID file: clean it up
                    debug!("Cleaning stale PID file for {}", service.name);
                    let _ = fs::remove_file(&pid_path);
                    ServiceState::Stopped
                }
                (None, _) => ServiceState::Stopped,
            };

            info!(
                "{:<10} {} (pid {:?}, heartbeat {:?}s)",
                service.name.to_uppercase(),
                state,
                pid,
                heartbeat_age
            );

            doc.services.insert(
                service.name.to_string(),
                ServiceStatusEntry {
                    state,
                    pid: if alive { pid } else { None },
                    heartbeat_age_seconds: heartbeat_age,
                },
            );
        }

        // The one-shot pre-market scanner: alive while a scan is running
        let pm_pid_path = self.state.pid_path("premarket");
        let pm_pid = read_pid(&pm_pid_path);
        let pm_alive = pm_pid.map(|p| process_alive(&system, p)).unwrap_or(false);
        if pm_pid.is_some() && !pm_alive {
            let _ = fs::remove_file(&pm_pid_path);
        }
        doc.services.insert(
            "premarket".to_string(),
            ServiceStatusEntry {
                state: if pm_alive {
                    ServiceState::Running
                } else {
                    ServiceState::Stopped
                },
                pid: if pm_alive { pm_pid } else { None },
                heartbeat_age_seconds: self.state.heartbeat_age_seconds("premarket", now),
            },
        );

        self.state.orchestrator_status_file().write(&doc)?;
        Ok(doc)
    }

    fn write_status(&mut self) -> Result<()> {
        self.status().map(|_| ())
    }

    /// Supervision loop. With `auto_restart`, crashed services come back
    /// with exponential backoff; the pre-market scanner is launched inside
    /// its ET window when today's watchlist is missing.
    pub async fn supervise(&mut self, auto_restart: bool, shutdown: Arc<AtomicBool>) -> Result<()> {
        info!(
            "Supervision loop entered (auto-restart: {})",
            if auto_restart { "on" } else { "off" }
        );
        let mut premarket_child: Option<Child> = None;

        while !shutdown.load(Ordering::Relaxed) {
            for i in 0..self.services.len() {
                let service = &mut self.services[i];
                let Some(child) = service.child.as_mut() else {
                    continue;
                };

                match child.try_wait() {
                    Ok(Some(status)) => {
                        let stable = service
                            .started_at
                            .map(|t| t.elapsed() >= STABILITY_RESET)
                            .unwrap_or(false);
                        if stable {
                            service.consecutive_failures = 0;
                        }
                        service.consecutive_failures += 1;
                        service.child = None;

                        if auto_restart {
                            let delay = service.backoff();
                            error!(
                                "{} crashed ({status}); restart in {:?} (failure #{})",
                                service.name, delay, service.consecutive_failures
                            );
                            service.restart_at = Some(Instant::now() + delay);
                        } else {
                            error!("{} crashed ({status})", service.name);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("{}: wait failed ({e})", service.name),
                }
            }

            if auto_restart {
                for i in 0..self.services.len() {
                    let due = self.services[i]
                        .restart_at
                        .map(|t| Instant::now() >= t)
                        .unwrap_or(false);
                    if due && self.services[i].child.is_none() {
                        self.services[i].restart_at = None;
                        self.start_service(i);
                    }
                }
            }

            self.schedule_premarket(&mut premarket_child);

            if let Err(e) = self.write_status() {
                warn!("Status write failed: {e:#}");
            }

            sleep_interruptible(SUPERVISION_INTERVAL, &shutdown).await;
        }

        info!("Shutdown requested");
        if let Some(mut child) = premarket_child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.stop_all()?;
        Ok(())
    }

    /// Launch the pre-market scanner inside its window when today's
    /// watchlist has not been built yet
    fn schedule_premarket(&mut self, slot: &mut Option<Child>) {
        // Reap a finished run
        if let Some(child) = slot.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!("Pre-market scan finished ({status})");
                    let _ = fs::remove_file(self.state.pid_path("premarket"));
                    *slot = None;
                }
                Ok(None) => return,
                Err(_) => return,
            }
        }

        let u = &self.config.universe;
        if !within_et_window(et_now(), u.scan_window_start_minutes, u.scan_window_end_minutes) {
            return;
        }

        let today = et_now().date_naive();
        match self.state.watchlist().load_for(today) {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!("Pre-market window open and no watchlist for {today}; launching scan");
                match self.spawn("premarket") {
                    Ok(child) => *slot = Some(child),
                    Err(e) => error!("Failed to launch pre-market scan: {e:#}"),
                }
            }
            Err(e) => warn!("Watchlist check failed: {e}"),
        }
    }
}

fn read_pid(path: &std::path::Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(system: &System, pid: u32) -> bool {
    system.process(Pid::from_u32(pid)).is_some()
}

/// SIGTERM, wait out the grace period, then SIGKILL
fn terminate_pid(system: &System, pid: u32, name: &str) {
    let Some(process) = system.process(Pid::from_u32(pid)) else {
        return;
    };

    info!("Stopping {name} (PID {pid})...");
    if process.kill_with(Signal::Term).is_none() {
        // Platform without SIGTERM support: hard kill
        process.kill();
        return;
    }

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while Instant::now() < deadline {
        let probe = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        if !process_alive(&probe, pid) {
            info!("{name} stopped");
            return;
        }
        std::thread::sleep(Duration::from_millis(500));
    }

    warn!("{name} did not stop within {}s; forcing", SHUTDOWN_GRACE.as_secs());
    process.kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut s = ManagedService::new("scanner", 3, 45);

        s.consecutive_failures = 1;
        assert_eq!(s.backoff(), Duration::from_secs(1));
        s.consecutive_failures = 2;
        assert_eq!(s.backoff(), Duration::from_secs(2));
        s.consecutive_failures = 3;
        assert_eq!(s.backoff(), Duration::from_secs(4));
        s.consecutive_failures = 7;
        assert_eq!(s.backoff(), Duration::from_secs(60));
        s.consecutive_failures = 50;
        assert_eq!(s.backoff(), Duration::from_secs(60));
    }

    #[test]
    fn test_priority_order_is_seller_first() {
        let config = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path()).unwrap();
        let orch = Orchestrator::new(config, state);

        let mut order: Vec<usize> = (0..orch.services.len()).collect();
        order.sort_by_key(|&i| orch.services[i].priority);
        assert_eq!(orch.services[order[0]].name, "seller");
        let names: Vec<_> = order.iter().map(|&i| orch.services[i].name).collect();
        assert_eq!(names.last(), Some(&"scanner"));
    }

    #[test]
    fn test_status_document_shape() {
        let config = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path()).unwrap();
        let mut orch = Orchestrator::new(config, state);

        let doc = orch.status().unwrap();
        assert_eq!(doc.services.len(), 5);
        for entry in doc.services.values() {
            assert_eq!(entry.state, ServiceState::Stopped);
        }
        assert!(dir.path().join("orchestrator_status.json").exists());
    }
}
