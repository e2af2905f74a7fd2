//! Supervision of named child commands.
//!
//! A [`Supervisor`] holds a table of registered commands. `supervise_all`
//! spawns every command that has not run yet and waits for all of them;
//! output is forwarded line by line to the subscribed log channel as
//! [`LogEvent`]s. Stopping a command kills it without waiting for exit.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// One piece of output from a supervised command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub name: String,
    pub text: String,
}

pub type LogSender = mpsc::UnboundedSender<LogEvent>;

/// Name, program, args, options and kill receiver of a command about to spawn
type PendingCommand = (String, String, Vec<String>, CommandOptions, watch::Receiver<bool>);

/// How command output reaches the log channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Forward each line as soon as it is read
    #[default]
    Streaming,
    /// Collect all output and forward it once the command exits
    Buffered,
}

/// Execution options for a registered command
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub output: OutputMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandState {
    Registered,
    Running,
    Exited,
}

struct SupervisedCommand {
    program: String,
    args: Vec<String>,
    options: CommandOptions,
    state: CommandState,
    /// Set while running; sending `true` kills the child
    kill_tx: Option<watch::Sender<bool>>,
}

/// Table of named commands plus an optional log subscriber
#[derive(Default)]
pub struct Supervisor {
    commands: DashMap<String, SupervisedCommand>,
    log_tx: Mutex<Option<LogSender>>,
    /// Set by `stop_all`; held while registering so no command slips in after
    closed: Mutex<bool>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command under `name`, replacing any previous registration.
    ///
    /// Returns false once `stop_all` has closed the supervisor.
    pub fn add(
        &self,
        name: &str,
        program: &str,
        args: Vec<String>,
        options: CommandOptions,
    ) -> bool {
        let closed = self.closed.lock();
        if *closed {
            debug!(name, "Supervisor closed, command not registered");
            return false;
        }
        if let Some((_, previous)) = self.commands.remove(name) {
            if let Some(kill_tx) = previous.kill_tx {
                let _ = kill_tx.send(true);
            }
        }
        self.commands.insert(
            name.to_string(),
            SupervisedCommand {
                program: program.to_string(),
                args,
                options,
                state: CommandState::Registered,
                kill_tx: None,
            },
        );
        true
    }

    /// Whether `stop_all` has been called
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Names of all registered commands
    pub fn list(&self) -> Vec<String> {
        self.commands.iter().map(|e| e.key().clone()).collect()
    }

    /// Subscribe a channel to log events, replacing any previous subscriber
    pub fn watch_logs(&self, tx: LogSender) {
        *self.log_tx.lock() = Some(tx);
    }

    /// Drop the log subscriber
    pub fn unwatch_logs(&self) {
        self.log_tx.lock().take();
    }

    fn log_sender(&self) -> Option<LogSender> {
        self.log_tx.lock().clone()
    }

    /// Kill a running command. Returns false if `name` is not registered.
    pub fn stop(&self, name: &str) -> bool {
        match self.commands.get(name) {
            Some(entry) => {
                if let Some(ref kill_tx) = entry.kill_tx {
                    let _ = kill_tx.send(true);
                }
                true
            }
            None => false,
        }
    }

    /// Unregister a command, killing it if it is still running
    pub fn remove(&self, name: &str) {
        if let Some((_, cmd)) = self.commands.remove(name) {
            if let Some(kill_tx) = cmd.kill_tx {
                let _ = kill_tx.send(true);
            }
        }
    }

    /// Kill and unregister every command, and refuse further registrations
    pub fn stop_all(&self) {
        let mut closed = self.closed.lock();
        *closed = true;
        for name in self.list() {
            self.stop(&name);
            self.remove(&name);
        }
    }

    /// Mark every registered command as running and hand back what is
    /// needed to spawn it. Nothing is taken once the supervisor is closed.
    fn take_registered(&self) -> Vec<PendingCommand> {
        let closed = self.closed.lock();
        if *closed {
            return Vec::new();
        }

        let mut pending = Vec::new();
        for mut entry in self.commands.iter_mut() {
            if entry.state != CommandState::Registered {
                continue;
            }
            let (kill_tx, kill_rx) = watch::channel(false);
            entry.state = CommandState::Running;
            entry.kill_tx = Some(kill_tx);
            pending.push((
                entry.key().clone(),
                entry.program.clone(),
                entry.args.clone(),
                entry.options.clone(),
                kill_rx,
            ));
        }
        pending
    }

    /// Run every registered command that has not been started yet and wait
    /// for all of them to finish.
    pub async fn supervise_all(&self) -> Vec<(String, io::Result<ExitStatus>)> {
        let pending = self.take_registered();

        let runs = pending.into_iter().map(|(name, program, args, options, kill_rx)| {
            let log_tx = self.log_sender();
            async move {
                let result = run_command(&name, &program, &args, &options, kill_rx, log_tx).await;
                (name, result)
            }
        });

        let results = futures::future::join_all(runs).await;

        for (name, _) in &results {
            if let Some(mut entry) = self.commands.get_mut(name) {
                entry.state = CommandState::Exited;
                entry.kill_tx = None;
            }
        }

        results
    }
}

async fn run_command(
    name: &str,
    program: &str,
    args: &[String],
    options: &CommandOptions,
    mut kill_rx: watch::Receiver<bool>,
    log_tx: Option<LogSender>,
) -> io::Result<ExitStatus> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    // Own process group so a kill reaches shells and their children
    #[cfg(unix)]
    cmd.process_group(0);

    if let Some(ref dir) = options.dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &options.env {
        cmd.env(key, value);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(name, program, error = %e, "Failed to spawn command");
            emit(&log_tx, name, format!("failed to spawn {}: {}", program, e));
            return Err(e);
        }
    };
    let pid = child.id().unwrap_or(0);
    info!(name, program, pid, "Command spawned");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let streaming = options.output == OutputMode::Streaming;

    let stdout_task = stdout.map(|s| tokio::spawn(forward_lines(s, name.to_string(), log_tx.clone(), streaming)));
    let stderr_task = stderr.map(|s| tokio::spawn(forward_lines(s, name.to_string(), log_tx.clone(), streaming)));

    let status = wait_or_kill(name, &mut child, &mut kill_rx).await;

    for task in [stdout_task, stderr_task].into_iter().flatten() {
        if let Ok(Some(collected)) = task.await {
            emit(&log_tx, name, collected);
        }
    }

    match status {
        Ok(ref s) => debug!(name, pid, status = ?s, "Command exited"),
        Err(ref e) => warn!(name, pid, error = %e, "Error waiting for command"),
    }
    status
}

async fn wait_or_kill(
    name: &str,
    child: &mut Child,
    kill_rx: &mut watch::Receiver<bool>,
) -> io::Result<ExitStatus> {
    loop {
        tokio::select! {
            status = child.wait() => return status,
            changed = kill_rx.changed() => {
                // A dropped sender means the command was unregistered
                if changed.is_err() || *kill_rx.borrow() {
                    info!(name, pid = child.id().unwrap_or(0), "Killing command");
                    #[cfg(unix)]
                    if let Some(pid) = child.id() {
                        unsafe {
                            libc::kill(-(pid as i32), libc::SIGKILL);
                        }
                    }
                    let _ = child.start_kill();
                    return child.wait().await;
                }
            }
        }
    }
}

/// Read lines from a child pipe. In streaming mode each line is sent
/// immediately; otherwise the joined output is returned once the pipe closes.
async fn forward_lines<R>(
    reader: R,
    name: String,
    log_tx: Option<LogSender>,
    streaming: bool,
) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut collected: Vec<String> = Vec::new();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if streaming {
                    emit(&log_tx, &name, line);
                } else {
                    collected.push(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(name = %name, error = %e, "Error reading command output");
                break;
            }
        }
    }

    if collected.is_empty() {
        None
    } else {
        Some(collected.join("\n"))
    }
}

fn emit(log_tx: &Option<LogSender>, name: &str, text: String) {
    if let Some(tx) = log_tx {
        let _ = tx.send(LogEvent {
            name: name.to_string(),
            text,
        });
    }
}
