use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use regex::Regex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::buffer::OutputBuffer;
use crate::error::WatchError;
use crate::trigger::{Backlog, MatchEvent, TriggerHandler, TriggerSet};

/// Configuration for spawning a watched process.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: "/bin/sh".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }
}

impl SessionConfig {
    pub fn new(
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Lifecycle of a watch session.
///
/// `Running` is entered on a successful spawn. A destroy request or a
/// process exit moves the session to `Terminating` (whichever happens
/// first); `Terminated` is published once the input writer and process
/// handles have been released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Terminating,
    Terminated,
}

enum SessionMessage {
    AddTrigger {
        pattern: Regex,
        backlog: Backlog,
        handler: TriggerHandler,
        respond_to: oneshot::Sender<Result<(), WatchError>>,
    },
    WriteInput {
        text: String,
        respond_to: oneshot::Sender<Result<(), WatchError>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<String>,
    },
}

/// Handle to a watched child process.
///
/// Cheap to clone; every clone addresses the same session. Dropping the
/// last handle tears the session down.
#[derive(Clone)]
pub struct CmdSession {
    id: Uuid,
    pid: Option<u32>,
    sender: mpsc::Sender<SessionMessage>,
    shutdown: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<SessionState>,
}

impl CmdSession {
    /// Spawn `config.command` and start watching its combined output.
    pub fn spawn(config: SessionConfig) -> Result<Self, WatchError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| WatchError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&config.command);
        for arg in &config.args {
            cmd.arg(arg);
        }
        if let Some(dir) = &config.working_dir {
            cmd.cwd(dir);
        }
        // a dumb terminal keeps escape-sequence noise out of the matched text
        cmd.env("TERM", "dumb");
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("failed to spawn command '{}': {}", config.command, e);
            WatchError::Spawn(e.to_string())
        })?;
        drop(pair.slave);

        let id = Uuid::new_v4();
        let pid = child.process_id();
        info!(session = %id, pid = ?pid, command = %config.command, "watch session started");

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| WatchError::Spawn(e.to_string()))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| WatchError::Spawn(e.to_string()))?;

        // blocking reader thread feeding the dispatch loop in natural
        // delivery chunks
        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(64);
        std::thread::spawn(move || {
            let mut buf = vec![0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!(session = %id, "output EOF, process exited");
                        break;
                    }
                    Ok(n) => {
                        if chunk_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(session = %id, "output stream closed: {}", e);
                        break;
                    }
                }
            }
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SessionState::Running);
        let (msg_tx, msg_rx) = mpsc::channel(32);

        let actor = SessionActor {
            id,
            _master: pair.master,
            writer: Some(writer),
            child,
            output: OutputBuffer::new(),
            triggers: TriggerSet::new(),
            receiver: msg_rx,
            chunks: chunk_rx,
            shutdown_rx,
            state_tx,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            id,
            pid,
            sender: msg_tx,
            shutdown: Arc::new(shutdown_tx),
            state_rx,
        })
    }

    /// Register a trigger: `handler` is invoked once for every new match
    /// of `pattern` in the process output. Matches already present in the
    /// output are replayed; use [`CmdSession::add_trigger_full`] to opt
    /// out.
    ///
    /// Fails with [`WatchError::InvalidPattern`] if the pattern does not
    /// compile, leaving other triggers untouched.
    pub async fn add_trigger<F>(&self, pattern: &str, handler: F) -> Result<(), WatchError>
    where
        F: FnMut(MatchEvent) -> anyhow::Result<()> + Send + 'static,
    {
        let compiled = Regex::new(pattern)?;
        self.add_trigger_full(compiled, Backlog::default(), handler)
            .await
    }

    /// Register a trigger with a precompiled pattern and an explicit
    /// backlog policy.
    pub async fn add_trigger_full<F>(
        &self,
        pattern: Regex,
        backlog: Backlog,
        handler: F,
    ) -> Result<(), WatchError>
    where
        F: FnMut(MatchEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.request(|respond_to| SessionMessage::AddTrigger {
            pattern,
            backlog,
            handler: Box::new(handler),
            respond_to,
        })
        .await?
    }

    /// Write `text` to the process input as-is.
    pub async fn send_input(&self, text: &str) -> Result<(), WatchError> {
        self.request(|respond_to| SessionMessage::WriteInput {
            text: text.to_string(),
            respond_to,
        })
        .await?
    }

    /// Write `line` followed by a newline to the process input.
    pub async fn send_line(&self, line: &str) -> Result<(), WatchError> {
        self.send_input(&format!("{line}\n")).await
    }

    /// An immutable copy of all output observed so far.
    pub async fn output_snapshot(&self) -> Result<String, WatchError> {
        self.request(|respond_to| SessionMessage::Snapshot { respond_to })
            .await
    }

    /// Request shutdown. Idempotent, safe from any thread, including from
    /// inside a trigger handler; returns immediately. No handler fires
    /// beyond the dispatch cycle already in flight.
    pub fn destroy(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait until the session has fully terminated and released the
    /// process handles.
    pub async fn closed(&self) {
        let mut rx = self.state_rx.clone();
        while *rx.borrow_and_update() != SessionState::Terminated {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_closing(&self) -> bool {
        *self.shutdown.borrow() || self.state() != SessionState::Running
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionMessage,
    ) -> Result<T, WatchError> {
        if self.is_closing() {
            return Err(WatchError::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| WatchError::SessionClosed)?;
        rx.await.map_err(|_| WatchError::SessionClosed)
    }
}

/// Exclusive owner of the child process, the output accumulator, and the
/// registered triggers. Runs the dispatch loop on its own task; all rule
/// mutation is funneled through the mailbox, so a dispatch cycle always
/// sees a consistent rule list without locking.
struct SessionActor {
    id: Uuid,
    _master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    output: OutputBuffer,
    triggers: TriggerSet,
    receiver: mpsc::Receiver<SessionMessage>,
    chunks: mpsc::Receiver<Vec<u8>>,
    shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionActor {
    async fn run(mut self) {
        debug!(session = %self.id, "dispatch loop started");
        loop {
            tokio::select! {
                // shutdown requests win over pending output and control
                // traffic
                biased;
                res = self.shutdown_rx.changed() => {
                    if res.is_err() || *self.shutdown_rx.borrow_and_update() {
                        debug!(session = %self.id, "shutdown requested");
                        break;
                    }
                }
                chunk = self.chunks.recv() => match chunk {
                    Some(chunk) => {
                        self.output.push(&chunk);
                        self.triggers.scan(self.output.as_str());
                    }
                    // output EOF: the process exited
                    None => break,
                },
                msg = self.receiver.recv() => match msg {
                    Some(msg) => {
                        if self.handle_message(msg) {
                            break;
                        }
                    }
                    // every handle dropped
                    None => break,
                },
            }
        }
        self.teardown().await;
    }

    /// Returns true when the session must stop.
    fn handle_message(&mut self, msg: SessionMessage) -> bool {
        match msg {
            SessionMessage::AddTrigger {
                pattern,
                backlog,
                handler,
                respond_to,
            } => {
                debug!(session = %self.id, pattern = %pattern, ?backlog, "trigger registered");
                self.triggers
                    .insert(pattern, backlog, handler, self.output.as_str());
                let _ = respond_to.send(Ok(()));
                false
            }
            SessionMessage::WriteInput { text, respond_to } => {
                let result = self.handle_write(&text);
                let failed = result.is_err();
                let _ = respond_to.send(result);
                if failed {
                    // a dead input pipe means the process is gone
                    warn!(session = %self.id, "input write failed, closing session");
                }
                failed
            }
            SessionMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.output.as_str().to_string());
                false
            }
        }
    }

    fn handle_write(&mut self, text: &str) -> Result<(), WatchError> {
        let writer = self.writer.as_mut().ok_or(WatchError::SessionClosed)?;
        writer
            .write_all(text.as_bytes())
            .map_err(|e| WatchError::Write(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| WatchError::Write(e.to_string()))?;
        Ok(())
    }

    async fn teardown(mut self) {
        let _ = self.state_tx.send(SessionState::Terminating);
        debug!(session = %self.id, "session terminating");

        // closing the writer ends the child's input stream
        self.writer = None;

        if let Ok(Some(status)) = self.child.try_wait() {
            info!(session = %self.id, ?status, "process exited");
        } else {
            #[cfg(unix)]
            {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;

                if let Some(pid) = self.child.process_id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
            }
            // brief grace for a clean exit before the hard kill
            for _ in 0..10 {
                if matches!(self.child.try_wait(), Ok(Some(_))) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            if !matches!(self.child.try_wait(), Ok(Some(_))) {
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }

        info!(session = %self.id, "watch session terminated");
        let _ = self.state_tx.send(SessionState::Terminated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builds_command_and_args() {
        let config = SessionConfig::new("cargo", ["build", "--release"]);
        assert_eq!(config.command, "cargo");
        assert_eq!(config.args, ["build", "--release"]);
        assert_eq!(config.rows, 24);
        assert_eq!(config.cols, 80);
    }

    #[test]
    fn default_config_is_a_shell() {
        let config = SessionConfig::default();
        assert_eq!(config.command, "/bin/sh");
        assert!(config.args.is_empty());
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Terminating).unwrap();
        assert_eq!(json, "\"terminating\"");
    }
}
