//! Managed app records and their lifecycle state machine.
//!
//! ```text
//! terminated ──start()──▶ starting ──▶ setup ──▶ running ──exit──▶ terminated
//!      ▲                                                     │
//!      └──────────────────────── stop() ◀────────────────────┘
//! ```
//!
//! `running` means the gateway has committed to running the command, not
//! that the backend is accepting connections yet.

use crate::config::AppKind;
use crate::logbuf::LineBuffer;
use crate::ports;
use crate::supervisor::{CommandOptions, LogEvent, OutputMode, Supervisor};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Returned by [`AppRecord::logs`] when nothing has been captured yet
pub const NO_LOGS_SENTINEL: &str = "No logs yet";

/// Environment variables that carry the assigned port to the backend
pub const PORT_ENV_VARS: [&str; 4] = [
    "MULTI_APP_PORT",
    "PORT",
    "GRADIO_SERVER_PORT",
    "STREAMLIT_SERVER_PORT",
];

/// Name of the per-app virtual environment directory
const VENV_DIR: &str = ".venv";

/// Lifecycle state of an app
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    /// No process; the only state from which `start()` is accepted
    Terminated,
    /// Preparing the isolated runtime environment
    Setup,
    /// Start accepted, launch task pending
    Starting,
    /// Long-lived command has been invoked
    Running,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppState::Terminated => "terminated",
            AppState::Setup => "setup",
            AppState::Starting => "starting",
            AppState::Running => "running",
        }
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejections from the lifecycle operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("app {0} is already running or starting to run")]
    AlreadyActive(String),
    #[error("app limit reached ({0} apps already active)")]
    CapacityExceeded(usize),
    #[error("app {0} is not active")]
    NotActive(String),
}

/// Paths inside an app's virtual environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonVenv {
    pub venv_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub activate: PathBuf,
}

impl PythonVenv {
    pub fn new(root_dir: &Path) -> Self {
        let venv_dir = root_dir.join(VENV_DIR);
        let bin_dir = venv_dir.join("bin");
        let activate = bin_dir.join("activate");
        Self {
            venv_dir,
            bin_dir,
            activate,
        }
    }
}

/// One supervised invocation in a launch sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchStep {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchStep {
    fn new(name: &str, program: &str, args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args,
        }
    }

    fn bash(name: &str, script: String) -> Self {
        Self::new(name, "/bin/bash", vec!["-c".to_string(), script])
    }
}

/// Environment preparation steps followed by the long-lived command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub setup: Vec<LaunchStep>,
    pub main: LaunchStep,
}

struct RecordInner {
    state: AppState,
    supervisor: Option<Arc<Supervisor>>,
    /// Bumped by every start/stop; launch tasks only write state while
    /// their generation is current
    generation: u64,
}

/// In-memory representation of one managed backend process
pub struct AppRecord {
    id: String,
    kind: AppKind,
    root_dir: PathBuf,
    command: Vec<String>,
    port: u16,
    python: String,
    logs: Arc<LineBuffer>,
    inner: Mutex<RecordInner>,
}

impl std::fmt::Debug for AppRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("port", &self.port)
            .field("state", &self.state())
            .finish()
    }
}

impl AppRecord {
    pub fn new(
        id: &str,
        kind: AppKind,
        root_dir: PathBuf,
        command: Vec<String>,
        port: u16,
        python: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            kind,
            root_dir,
            command,
            port,
            python: python.to_string(),
            logs: Arc::new(LineBuffer::default()),
            inner: Mutex::new(RecordInner {
                state: AppState::Terminated,
                supervisor: None,
                generation: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> AppKind {
        self.kind
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == AppState::Running
    }

    /// Whether a supervision handle is currently attached
    pub fn has_supervisor(&self) -> bool {
        self.inner.lock().supervisor.is_some()
    }

    /// Snapshot of captured output, or [`NO_LOGS_SENTINEL`]
    pub fn logs(&self) -> String {
        if self.logs.is_empty() {
            return NO_LOGS_SENTINEL.to_string();
        }
        self.logs.snapshot()
    }

    /// Environment passed to every command of this app
    pub fn command_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        let port = self.port.to_string();
        for key in PORT_ENV_VARS {
            env.insert(key.to_string(), port.clone());
        }
        if self.kind == AppKind::Python {
            let venv = PythonVenv::new(&self.root_dir);
            let path = std::env::var("PATH").unwrap_or_default();
            let search_path = if path.is_empty() {
                venv.bin_dir.display().to_string()
            } else {
                format!("{}:{}", venv.bin_dir.display(), path)
            };
            env.insert("PATH".to_string(), search_path);
            env.insert("VIRTUAL_ENV".to_string(), venv.venv_dir.display().to_string());
        }
        env
    }

    fn command_options(&self) -> CommandOptions {
        CommandOptions {
            dir: Some(self.root_dir.clone()),
            env: self.command_env(),
            output: OutputMode::Streaming,
        }
    }

    /// Launch sequence for this app's kind, `None` when the kind has no
    /// launcher
    pub fn launch_plan(&self) -> Option<LaunchPlan> {
        match self.kind {
            AppKind::Python => Some(self.python_plan()),
            AppKind::R | AppKind::Nodejs => None,
        }
    }

    fn python_plan(&self) -> LaunchPlan {
        let venv = PythonVenv::new(&self.root_dir);
        let activate = shell_words::quote(&venv.activate.display().to_string()).into_owned();
        let requirements = self.root_dir.join("requirements.txt");

        let setup = vec![
            LaunchStep::new(
                "setupVenv",
                &self.python,
                vec!["-m".to_string(), "venv".to_string(), venv.venv_dir.display().to_string()],
            ),
            LaunchStep::bash(
                "installRequirements",
                format!(
                    "source {} && pip install -r {}",
                    activate,
                    shell_words::quote(&requirements.display().to_string())
                ),
            ),
            LaunchStep::new(
                "locatePython",
                "python",
                vec!["-c".to_string(), "import sys; print(sys.executable)".to_string()],
            ),
            LaunchStep::bash("showPackages", format!("source {} && pip list", activate)),
        ];

        let main = LaunchStep::bash(
            &self.id,
            format!("source {} && {}", activate, shell_words::join(&self.command)),
        );

        LaunchPlan { setup, main }
    }

    /// Begin a start cycle.
    ///
    /// Fails without touching state unless the record is `terminated`. On
    /// success the launch runs on its own task and this returns immediately;
    /// setup failures only show up in state and logs.
    pub fn start(self: &Arc<Self>) -> Result<(), LifecycleError> {
        let (supervisor, generation) = {
            let mut inner = self.inner.lock();
            if inner.state != AppState::Terminated {
                return Err(LifecycleError::AlreadyActive(self.id.clone()));
            }
            if let Some(old) = inner.supervisor.take() {
                old.stop_all();
                old.unwatch_logs();
            }
            let supervisor = Arc::new(Supervisor::new());
            inner.generation += 1;
            inner.state = AppState::Starting;
            inner.supervisor = Some(Arc::clone(&supervisor));
            (supervisor, inner.generation)
        };

        info!(app = %self.id, port = self.port, kind = %self.kind, "Starting app");

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        supervisor.watch_logs(log_tx);
        tokio::spawn(drain_logs(self.id.clone(), log_rx, Arc::clone(&self.logs)));

        let record = Arc::clone(self);
        tokio::spawn(async move {
            record.launch(supervisor, generation).await;
        });

        Ok(())
    }

    /// Kill every process of this record and force `terminated`.
    ///
    /// Does not wait for the processes to exit.
    pub fn stop(&self) {
        let supervisor = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.state = AppState::Terminated;
            inner.supervisor.take()
        };

        info!(app = %self.id, "Stopping app");

        if let Some(supervisor) = supervisor {
            supervisor.stop_all();
            supervisor.unwatch_logs();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }

    /// Set state only if `generation` is still the active cycle
    fn transition(&self, generation: u64, state: AppState) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        debug!(app = %self.id, from = %inner.state, to = %state, "State transition");
        inner.state = state;
        true
    }

    async fn launch(&self, supervisor: Arc<Supervisor>, generation: u64) {
        if let Err(e) = ports::kill_port(self.port).await {
            debug!(app = %self.id, port = self.port, error = %e, "Port reclamation skipped");
        }

        let Some(plan) = self.launch_plan() else {
            warn!(app = %self.id, kind = %self.kind, "No launcher for app kind");
            self.logs
                .append(&format!("no launcher available for app kind '{}'", self.kind));
            self.transition(generation, AppState::Terminated);
            return;
        };

        if !plan.setup.is_empty() {
            if !self.transition(generation, AppState::Setup) {
                return;
            }
            info!(app = %self.id, "Setting up app environment");
        }

        for step in &plan.setup {
            if !self.is_current(generation) {
                debug!(app = %self.id, step = %step.name, "Launch superseded, abandoning setup");
                return;
            }
            if let Err(reason) = self.run_step(&supervisor, step).await {
                if !self.is_current(generation) {
                    debug!(app = %self.id, step = %step.name, "Setup step ended by stop");
                    return;
                }
                error!(app = %self.id, step = %step.name, reason = %reason, "Setup step failed");
                self.logs
                    .append(&format!("setup step {} failed: {}", step.name, reason));
                return;
            }
        }

        if !self.transition(generation, AppState::Running) {
            return;
        }

        info!(app = %self.id, port = self.port, "Running app command");
        // A stop() after the transition closes the supervisor, so the command is never spawned
        if !supervisor.add(&plan.main.name, &plan.main.program, plan.main.args.clone(), self.command_options()) {
            debug!(app = %self.id, "Launch superseded before running app command");
            return;
        }
        for (name, result) in supervisor.supervise_all().await {
            match result {
                Ok(status) => info!(app = %self.id, command = %name, ?status, "App command exited"),
                Err(e) => error!(app = %self.id, command = %name, error = %e, "App command failed"),
            }
        }

        self.transition(generation, AppState::Terminated);
    }

    async fn run_step(&self, supervisor: &Supervisor, step: &LaunchStep) -> Result<(), String> {
        debug!(app = %self.id, step = %step.name, program = %step.program, "Running setup step");
        if !supervisor.add(&step.name, &step.program, step.args.clone(), self.command_options()) {
            return Err("supervisor stopped".to_string());
        }
        let results = supervisor.supervise_all().await;
        supervisor.remove(&step.name);

        match results.into_iter().find(|(name, _)| name == &step.name) {
            Some((_, Ok(status))) if status.success() => Ok(()),
            Some((_, Ok(status))) => Err(format!("exited with {}", status)),
            Some((_, Err(e))) => Err(e.to_string()),
            None => Err("step was not run".to_string()),
        }
    }
}

/// Move log events into the ring buffer until the channel closes
async fn drain_logs(
    app: String,
    mut rx: mpsc::UnboundedReceiver<LogEvent>,
    logs: Arc<LineBuffer>,
) {
    while let Some(event) = rx.recv().await {
        logs.append(&event.text);
    }
    debug!(app = %app, "Log stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: AppKind) -> Arc<AppRecord> {
        Arc::new(AppRecord::new(
            "demo",
            kind,
            PathBuf::from("/srv/demo"),
            vec!["streamlit".to_string(), "run".to_string(), "app.py".to_string()],
            48101,
            "python3",
        ))
    }

    #[test]
    fn test_initial_state() {
        let app = record(AppKind::Python);
        assert_eq!(app.state(), AppState::Terminated);
        assert!(!app.has_supervisor());
        assert_eq!(app.logs(), NO_LOGS_SENTINEL);
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(AppState::Terminated.to_string(), "terminated");
        assert_eq!(AppState::Setup.to_string(), "setup");
        assert_eq!(AppState::Starting.to_string(), "starting");
        assert_eq!(AppState::Running.to_string(), "running");
        assert_eq!(serde_json::to_string(&AppState::Running).unwrap(), "\"running\"");
    }

    #[test]
    fn test_command_env_carries_port() {
        let app = record(AppKind::Nodejs);
        let env = app.command_env();
        for key in PORT_ENV_VARS {
            assert_eq!(env.get(key).map(String::as_str), Some("48101"));
        }
        assert!(!env.contains_key("VIRTUAL_ENV"));
    }

    #[test]
    fn test_python_env_prepends_venv() {
        let app = record(AppKind::Python);
        let env = app.command_env();
        assert!(env["PATH"].starts_with("/srv/demo/.venv/bin"));
        assert_eq!(env["VIRTUAL_ENV"], "/srv/demo/.venv");
    }

    #[test]
    fn test_python_launch_plan() {
        let plan = record(AppKind::Python).launch_plan().unwrap();

        let names: Vec<&str> = plan.setup.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["setupVenv", "installRequirements", "locatePython", "showPackages"]);

        assert_eq!(plan.setup[0].program, "python3");
        assert_eq!(plan.setup[0].args, vec!["-m", "venv", "/srv/demo/.venv"]);
        assert_eq!(
            plan.setup[1].args[1],
            "source /srv/demo/.venv/bin/activate && pip install -r /srv/demo/requirements.txt"
        );

        assert_eq!(plan.main.name, "demo");
        assert_eq!(plan.main.program, "/bin/bash");
        assert_eq!(
            plan.main.args,
            vec!["-c", "source /srv/demo/.venv/bin/activate && streamlit run app.py"]
        );
    }

    #[test]
    fn test_other_kinds_have_no_launcher() {
        assert!(record(AppKind::R).launch_plan().is_none());
        assert!(record(AppKind::Nodejs).launch_plan().is_none());
    }

    #[test]
    fn test_stop_when_terminated_is_harmless() {
        let app = record(AppKind::Python);
        app.stop();
        app.stop();
        assert_eq!(app.state(), AppState::Terminated);
        assert!(!app.has_supervisor());
    }

    #[tokio::test]
    async fn test_start_twice_fails_without_mutation() {
        let app = record(AppKind::R);
        app.inner.lock().state = AppState::Running;
        let err = app.start().unwrap_err();
        assert_eq!(err, LifecycleError::AlreadyActive("demo".to_string()));
        assert_eq!(app.state(), AppState::Running);
        assert!(!app.has_supervisor());
    }

    #[tokio::test]
    async fn test_start_sets_starting_and_attaches_supervisor() {
        let app = record(AppKind::R);
        app.start().unwrap();

        // The launch task has not been polled yet on the test runtime
        assert_eq!(app.state(), AppState::Starting);
        assert!(app.has_supervisor());
        assert!(matches!(app.start(), Err(LifecycleError::AlreadyActive(_))));

        app.stop();
        assert_eq!(app.state(), AppState::Terminated);
        assert!(!app.has_supervisor());
    }

    #[tokio::test]
    async fn test_kind_without_launcher_returns_to_terminated() {
        let app = record(AppKind::Nodejs);
        app.start().unwrap();

        for _ in 0..100 {
            if app.state() == AppState::Terminated {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        assert_eq!(app.state(), AppState::Terminated);
        // The handle stays until stop() so the scheduler keeps tracking it
        assert!(app.has_supervisor());
        for _ in 0..50 {
            if app.logs().contains("no launcher") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(app.logs().contains("no launcher available for app kind 'nodejs'"));
    }

    /// Code directory with a `.venv` whose `pip` runs `pip_script`
    #[cfg(unix)]
    fn venv_record(pip_script: &str, port: u16) -> (tempfile::TempDir, Arc<AppRecord>) {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(".venv/bin");
        std::fs::create_dir_all(&bin).unwrap();
        for (name, script) in [("python", "exit 0"), ("pip", pip_script)] {
            let path = bin.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        std::fs::write(bin.join("activate"), "").unwrap();

        let python = bin.join("python").display().to_string();
        let app = Arc::new(AppRecord::new(
            "demo",
            AppKind::Python,
            dir.path().to_path_buf(),
            vec!["sleep".to_string(), "30".to_string()],
            port,
            &python,
        ));
        (dir, app)
    }

    #[cfg(unix)]
    async fn wait_for(app: &AppRecord, state: AppState) -> bool {
        for _ in 0..250 {
            if app.state() == state {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        false
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_setup_is_not_logged_as_failure() {
        let (_dir, app) = venv_record("sleep 30", 48121);
        app.start().unwrap();
        assert!(wait_for(&app, AppState::Setup).await);
        let supervisor = app.inner.lock().supervisor.clone().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        app.stop();
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        assert_eq!(app.state(), AppState::Terminated);
        assert!(!app.logs().contains("failed"), "{}", app.logs());
        // The main command was never registered on the stopped supervisor
        assert!(supervisor.is_closed());
        assert!(supervisor.list().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_while_running_leaves_nothing_behind() {
        let (_dir, app) = venv_record("exit 0", 48131);
        app.start().unwrap();
        assert!(wait_for(&app, AppState::Running).await);
        let supervisor = app.inner.lock().supervisor.clone().unwrap();

        app.stop();
        assert_eq!(app.state(), AppState::Terminated);
        assert!(supervisor.is_closed());
        assert!(!supervisor.add("late", "sleep", vec!["30".to_string()], CommandOptions::default()));

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(supervisor.list().is_empty());
        assert_eq!(app.state(), AppState::Terminated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_setup_step_stays_in_setup() {
        let (_dir, app) = venv_record("exit 3", 48141);
        app.start().unwrap();

        let mut logs = String::new();
        for _ in 0..250 {
            logs = app.logs();
            if logs.contains("setup step") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(logs.contains("setup step installRequirements failed: exited with"), "{}", logs);
        assert_eq!(app.state(), AppState::Setup);

        app.stop();
    }

    #[test]
    fn test_stale_generation_cannot_transition() {
        let app = record(AppKind::Python);
        let stale = app.inner.lock().generation;
        app.stop();
        assert!(!app.transition(stale, AppState::Running));
        assert_eq!(app.state(), AppState::Terminated);
    }
}
