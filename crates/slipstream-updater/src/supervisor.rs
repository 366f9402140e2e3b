//! Supervisor and update strategy engine.
//!
//! The supervisor launches the best installed version of the application
//! as a child process and interprets its exit code: the magic code `126`
//! means "a newer version may be installed now, re-evaluate and relaunch";
//! everything else passes through. A re-launched child recognizes itself
//! via the `AUTOUPDATER_<APP>_INSTALL_ROOT` environment variable, wraps
//! the real workload, and coordinates one background check/download
//! worker according to the update strategy.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::channel::ReleaseType;
use crate::config::UpdaterConfig;
use crate::download::ProgressCallback;
use crate::error::{ErrorListener, UpdateError};
use crate::manager::UpdateManager;
use crate::manifest::UpdateInfo;

/// A child exits with this code to request re-evaluation and relaunch.
pub const MAGIC_RELAUNCH_EXIT_CODE: i32 = 126;

/// Delay applied when the re-spawn sleep flag is observed.
const RESPAWN_SLEEP: Duration = Duration::from_secs(10);

/// When and how much update work the wrapper does around the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Check before the workload runs; never download
    CheckBefore,
    /// Check concurrently with the workload; never download
    #[default]
    CheckDuring,
    /// Check after the workload finishes; never download
    CheckAfter,
    /// Check and install before the workload runs
    InstallBefore,
    /// Check and install concurrently with the workload
    InstallDuring,
    /// Check and install after the workload finishes
    InstallAfter,
    /// No update activity at all
    Never,
}

impl Strategy {
    /// Parse a strategy name case-insensitively.
    pub fn parse(s: &str) -> Option<Strategy> {
        match s.trim().to_ascii_lowercase().as_str() {
            "checkbefore" => Some(Strategy::CheckBefore),
            "checkduring" => Some(Strategy::CheckDuring),
            "checkafter" => Some(Strategy::CheckAfter),
            "installbefore" => Some(Strategy::InstallBefore),
            "installduring" => Some(Strategy::InstallDuring),
            "installafter" => Some(Strategy::InstallAfter),
            "never" => Some(Strategy::Never),
            _ => None,
        }
    }

    /// Decompose into the orthogonal booleans the wrapper actually runs on.
    pub fn plan(self) -> StrategyPlan {
        let (check, download) = match self {
            Strategy::Never => (false, false),
            Strategy::CheckBefore | Strategy::CheckDuring | Strategy::CheckAfter => (true, false),
            Strategy::InstallBefore | Strategy::InstallDuring | Strategy::InstallAfter => {
                (true, true)
            }
        };
        let timing = match self {
            Strategy::CheckBefore | Strategy::InstallBefore => Timing::Before,
            Strategy::CheckDuring | Strategy::InstallDuring => Timing::During,
            Strategy::CheckAfter | Strategy::InstallAfter => Timing::After,
            Strategy::Never => Timing::None,
        };
        StrategyPlan {
            check,
            download,
            timing,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::CheckBefore => "CheckBefore",
            Strategy::CheckDuring => "CheckDuring",
            Strategy::CheckAfter => "CheckAfter",
            Strategy::InstallBefore => "InstallBefore",
            Strategy::InstallDuring => "InstallDuring",
            Strategy::InstallAfter => "InstallAfter",
            Strategy::Never => "Never",
        };
        f.write_str(name)
    }
}

/// When the background worker runs relative to the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
    /// Worker joined before the workload starts
    Before,
    /// Worker runs concurrently; joined after the workload
    During,
    /// Worker started and joined after the workload
    After,
    /// No worker
    None,
}

/// A strategy decomposed into its orthogonal parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyPlan {
    /// Whether to check for an update at all
    pub check: bool,
    /// Whether a found update is also downloaded and installed
    pub download: bool,
    /// When the worker runs
    pub timing: Timing,
}

/// Launches the application from its most recent installed version.
pub struct Supervisor {
    config: UpdaterConfig,
    default_strategy: Strategy,
    error_listener: Option<ErrorListener>,
    progress: Option<ProgressCallback>,
}

impl Supervisor {
    /// Create a supervisor with a default strategy.
    pub fn new(config: UpdaterConfig, default_strategy: Strategy) -> Self {
        Self {
            config,
            default_strategy,
            error_listener: None,
            progress: None,
        }
    }

    /// Attach the process-wide error listener.
    pub fn with_error_listener(mut self, listener: ErrorListener) -> Self {
        self.error_listener = Some(listener);
        self
    }

    /// Attach a download progress callback.
    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Run the workload from the most recent version.
    ///
    /// Three modes, decided by the environment:
    /// - updates disabled (`AUTOUPDATER_<APP>_SKIP_UPDATE`): the workload
    ///   runs directly, nothing else happens;
    /// - re-launched child (`AUTOUPDATER_<APP>_INSTALL_ROOT` present): the
    ///   workload is wrapped with the strategy from
    ///   `AUTOUPDATER_<APP>_POLICY` (or the default) and its exit code is
    ///   returned;
    /// - supervisor: the best installed version is spawned as a child in a
    ///   loop; the magic exit code relaunches, anything else is returned.
    pub fn run<F>(self, workload: F, args: &[String]) -> i32
    where
        F: FnOnce(&[String]) -> i32,
    {
        if self.updates_disabled() {
            info!("update mechanism disabled; running workload directly");
            return run_workload(workload, args);
        }

        if self.observe_sleep_flag() {
            info!("re-spawn flag observed; sleeping before startup");
            thread::sleep(RESPAWN_SLEEP);
        }

        let child_base = std::env::var(self.config.env_var("INSTALL_ROOT"))
            .ok()
            .filter(|v| !v.trim().is_empty());

        match child_base {
            Some(base) => self.run_as_child(workload, args, Path::new(&base)),
            None => self.run_as_supervisor(workload, args),
        }
    }

    /// Report a recovered error to the listener and the log.
    ///
    /// Used for failures recovered before or outside a manager (building
    /// one, spawning a child); errors inside manager operations go through
    /// the manager's own reporting.
    fn report_error(&self, err: &UpdateError) {
        tracing::error!(error = %err, "update error");
        if let Some(listener) = &self.error_listener {
            listener(err);
        }
    }

    fn updates_disabled(&self) -> bool {
        match std::env::var(self.config.env_var("SKIP_UPDATE")) {
            Ok(value) => {
                let v = value.trim().to_ascii_lowercase();
                v == "true" || v == "1" || v == "yes"
            }
            Err(_) => false,
        }
    }

    /// Observe and clear the transient re-spawn sleep flag.
    fn observe_sleep_flag(&self) -> bool {
        let var = self.config.env_var("SLEEP");
        if std::env::var(&var).map(|v| !v.is_empty()).unwrap_or(false) {
            std::env::remove_var(&var);
            return true;
        }
        false
    }

    /// Re-launched child: wrap the workload per the effective strategy.
    fn run_as_child<F>(self, workload: F, args: &[String], base_dir: &Path) -> i32
    where
        F: FnOnce(&[String]) -> i32,
    {
        let strategy = std::env::var(self.config.env_var("POLICY"))
            .ok()
            .and_then(|v| Strategy::parse(&v))
            .unwrap_or(self.default_strategy);
        debug!(%strategy, "running as re-launched child");

        match self.build_manager(base_dir) {
            Ok(manager) => wrap(&manager, strategy.plan(), workload, args),
            Err(e) => {
                self.report_error(&e);
                warn!("updater unavailable; running workload unwrapped");
                run_workload(workload, args)
            }
        }
    }

    /// Supervisor: spawn the best version in a loop.
    fn run_as_supervisor<F>(self, workload: F, args: &[String]) -> i32
    where
        F: FnOnce(&[String]) -> i32,
    {
        let base_dir = match std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            Some(dir) => dir,
            None => {
                warn!("cannot locate own executable; running workload unwrapped");
                return run_workload(workload, args);
            }
        };

        let manager = match self.build_manager(&base_dir) {
            Ok(manager) => manager,
            Err(e) => {
                self.report_error(&e);
                warn!("updater unavailable; running workload unwrapped");
                return run_workload(workload, args);
            }
        };

        let install_root_var = manager.config().env_var("INSTALL_ROOT");
        loop {
            let best = manager.get_best_version(true);
            info!(folder = %best.folder.display(), version = %best.version, "launching");

            match spawn_child(&best.folder, args, &install_root_var, &base_dir) {
                Ok(code) if code == MAGIC_RELAUNCH_EXIT_CODE => {
                    info!("child requested relaunch");
                    continue;
                }
                Ok(code) => return code,
                Err(e) => {
                    manager.report(&e);
                    warn!("launch failed; running workload in-process");
                    return wrap(&manager, self.default_strategy.plan(), workload, args);
                }
            }
        }
    }

    fn build_manager(&self, base_dir: &Path) -> Result<Arc<UpdateManager>, UpdateError> {
        let mut manager = UpdateManager::new(self.config.clone(), base_dir.to_path_buf())?;
        if let Some(listener) = &self.error_listener {
            manager.set_error_listener(Arc::clone(listener));
        }
        if let Some(progress) = &self.progress {
            manager.set_progress_callback(Arc::clone(progress));
        }
        Ok(Arc::new(manager))
    }
}

/// Convenience entry point: supervisor with no listeners attached.
pub fn run_from_most_recent<F>(
    config: UpdaterConfig,
    workload: F,
    args: &[String],
    default_strategy: Strategy,
) -> i32
where
    F: FnOnce(&[String]) -> i32,
{
    Supervisor::new(config, default_strategy).run(workload, args)
}

/// Wrap the workload with the strategy's background worker.
///
/// Exactly one worker thread is ever started; its result is read only
/// after join, and every strategy that starts it also joins it before
/// this function returns.
fn wrap<F>(manager: &Arc<UpdateManager>, plan: StrategyPlan, workload: F, args: &[String]) -> i32
where
    F: FnOnce(&[String]) -> i32,
{
    let mut worker = None;

    if plan.check && plan.timing != Timing::After {
        worker = Some(spawn_worker(manager, plan));
    }

    if plan.timing == Timing::Before {
        if let Some(handle) = worker.take() {
            info!("waiting for update check before launch");
            finish_worker(handle);
        }
    }

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| workload(args)));

    match outcome {
        Ok(code) => {
            if plan.check && plan.timing == Timing::After {
                worker = Some(spawn_worker(manager, plan));
            }
            if let Some(handle) = worker.take() {
                finish_worker(handle);
            }
            code
        }
        Err(payload) => {
            // A worker that was started is joined even when the workload
            // crashed; only then does the unwind continue.
            if let Some(handle) = worker.take() {
                finish_worker(handle);
            }
            record_crash(payload)
        }
    }
}

fn spawn_worker(
    manager: &Arc<UpdateManager>,
    plan: StrategyPlan,
) -> JoinHandle<(Option<UpdateInfo>, bool)> {
    let manager = Arc::clone(manager);
    let delay = if plan.timing == Timing::During {
        // Give short-lived workloads a head start before touching the
        // network; the result only matters for the next launch anyway.
        Duration::from_secs(manager.config().during_delay_secs)
    } else {
        Duration::ZERO
    };
    let download = plan.download;

    thread::spawn(move || {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let update = manager.check_for_update(ReleaseType::Unknown);
        let installed = match &update {
            Some(update) if download => manager.download_and_unpack(update),
            _ => false,
        };
        (update, installed)
    })
}

fn finish_worker(handle: JoinHandle<(Option<UpdateInfo>, bool)>) {
    match handle.join() {
        Ok((Some(update), installed)) => {
            if installed {
                info!(
                    version = %update.parsed_version(),
                    "update installed; takes effect on next launch"
                );
            } else {
                info!(version = %update.parsed_version(), "update available");
            }
        }
        Ok((None, _)) => debug!("no update available"),
        Err(_) => warn!("update worker panicked"),
    }
}

/// Run the workload, producing a crashlog on panic.
///
/// The panic is re-raised after the log is written so an outer host still
/// observes the original unwind.
fn run_workload<F>(workload: F, args: &[String]) -> i32
where
    F: FnOnce(&[String]) -> i32,
{
    match std::panic::catch_unwind(AssertUnwindSafe(|| workload(args))) {
        Ok(code) => code,
        Err(payload) => record_crash(payload),
    }
}

fn record_crash(payload: Box<dyn std::any::Any + Send>) -> ! {
    let message = panic_message(payload.as_ref());
    warn!(message, "workload crashed; writing crashlog.txt");
    let entry = format!("{} workload crashed: {}\n", Utc::now().to_rfc3339(), message);
    if let Err(e) = std::fs::write("crashlog.txt", entry) {
        warn!(error = %e, "failed to write crashlog.txt");
    }
    std::panic::resume_unwind(payload)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

/// Spawn the executable residing in `folder` and wait for it.
///
/// The child gets the original arguments, the inherited environment plus
/// `AUTOUPDATER_<APP>_INSTALL_ROOT`, and the supervisor's stdio streams.
/// A child killed without an exit code reports as failure (1).
fn spawn_child(
    folder: &Path,
    args: &[String],
    install_root_var: &str,
    base_dir: &Path,
) -> Result<i32, UpdateError> {
    let exe_name = std::env::current_exe()
        .map_err(|e| UpdateError::Launch(format!("cannot locate own executable: {e}")))?
        .file_name()
        .ok_or_else(|| UpdateError::Launch("own executable has no file name".to_string()))?
        .to_os_string();
    let exe = folder.join(exe_name);

    let status = Command::new(&exe)
        .args(args)
        .env(install_root_var, base_dir)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|e| UpdateError::Launch(format!("failed to spawn {}: {e}", exe.display())))?;

    Ok(status.code().unwrap_or(1))
}
