//! Supervisor for the presence child process.
//!
//! Owns at most one child at a time. Commands are relayed to the child over
//! its stdin; its stdout is parsed into lifecycle events and everything it
//! prints lands in a bounded log buffer. A child that exits on its own is
//! respawned and told to log in again.

use std::future::Future;
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::process::{request_terminate, ChildSpec, PresenceProcess, SpawnError};
use super::ring::LogRingBuffer;
use crate::config::SupervisorConfig;
use crate::ipc::{spawn_writer, Command, Event, Incoming, IpcReader, IpcSender};

/// How long to wait for output readers after the child exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

const EVENT_CAPACITY: usize = 256;

/// Error type for supervisor operations.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    /// No child is running.
    #[error("No presence child is running")]
    NoChild,
    /// The child could not be started.
    #[error("Failed to spawn presence child: {0}")]
    Spawn(#[from] SpawnError),
    /// The child's command channel is closed.
    #[error("Command channel to the child is closed")]
    ChannelClosed,
}

/// How to stop the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM; the child may clean up.
    Graceful,
    /// SIGKILL.
    Forced,
}

/// Something observed by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A child was started.
    Spawned { pid: u32 },
    /// The child reported a lifecycle event.
    Child(Event),
    /// The child printed a line that is not an event.
    Output(String),
    /// The child exited.
    Exited { code: Option<i32> },
}

/// Handle to the supervisor. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    spec: ChildSpec,
    config: SupervisorConfig,
    /// Serializes spawns so at most one child exists.
    spawn_lock: tokio::sync::Mutex<()>,
    slot: tokio::sync::Mutex<Option<ChildHandle>>,
    logs: Mutex<LogRingBuffer>,
    events: broadcast::Sender<SupervisorEvent>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

struct ChildHandle {
    generation: u64,
    pid: u32,
    commands: IpcSender<Command>,
    respawn: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
    kill: CancellationToken,
}

impl Supervisor {
    /// Supervisor for the child described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if no program is configured and the current
    /// executable cannot be determined.
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let spec = match &config.program {
            Some(program) => ChildSpec::new(program.clone()),
            None => ChildSpec::current_exe()?,
        }
        .args(config.args.iter().cloned());
        Ok(Self::with_spec(spec, config))
    }

    #[must_use]
    pub fn with_spec(spec: ChildSpec, config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                spec,
                logs: Mutex::new(LogRingBuffer::new(config.log_capacity)),
                config,
                spawn_lock: tokio::sync::Mutex::new(()),
                slot: tokio::sync::Mutex::new(None),
                events,
                generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Receive supervisor events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Start a child, stopping any existing one first, and tell it to log in.
    ///
    /// Returns the new child's pid.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Spawn`] if the child cannot be started.
    pub async fn spawn(&self) -> Result<u32, SupervisorError> {
        let _guard = self.inner.spawn_lock.lock().await;
        Arc::clone(&self.inner).replace_child().await
    }

    /// Stop the current child without respawning it.
    ///
    /// Returns whether the child was confirmed gone within `timeout`. With no
    /// child running this is trivially `true`.
    pub async fn terminate(&self, termination: Termination, timeout: Duration) -> bool {
        self.inner.terminate(termination, timeout).await
    }

    /// Stop supervising: no more respawns, and the child is terminated,
    /// escalating to a forced kill if it ignores the graceful request.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let timeout = self.inner.config.terminate_timeout();
        if !self.inner.terminate(Termination::Graceful, timeout).await {
            tracing::warn!("Child ignored termination request, killing");
            if !self.inner.terminate(Termination::Forced, timeout).await {
                tracing::error!("Child did not exit after a forced kill");
            }
        }
    }

    /// Relay a command to the child.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::NoChild`] if no child is running
    /// - [`SupervisorError::ChannelClosed`] if the child stopped reading
    pub async fn send(&self, command: Command) -> Result<(), SupervisorError> {
        let slot = self.inner.slot.lock().await;
        let Some(handle) = slot.as_ref() else {
            tracing::error!(?command, "No presence child to receive command");
            return Err(SupervisorError::NoChild);
        };
        if handle.commands.send(command) {
            Ok(())
        } else {
            Err(SupervisorError::ChannelClosed)
        }
    }

    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn login(&self) -> Result<(), SupervisorError> {
        self.send(Command::Login).await
    }

    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn disconnect(&self, reason: Option<String>) -> Result<(), SupervisorError> {
        self.send(Command::Disconnect { reason }).await
    }

    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn reconnect(&self) -> Result<(), SupervisorError> {
        self.send(Command::Reconnect).await
    }

    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn chat(&self, message: impl Into<String>) -> Result<(), SupervisorError> {
        self.send(Command::Chat {
            message: message.into(),
        })
        .await
    }

    /// Ask the child to exit. The supervisor respawns it.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn exit(&self) -> Result<(), SupervisorError> {
        self.send(Command::Exit).await
    }

    /// Recent child output, oldest first.
    #[must_use]
    pub fn logs(&self) -> Vec<String> {
        self.inner.lock_logs().snapshot()
    }

    /// Pid of the current child.
    pub async fn pid(&self) -> Option<u32> {
        self.inner.slot.lock().await.as_ref().map(|h| h.pid)
    }
}

impl Inner {
    fn lock_logs(&self) -> MutexGuard<'_, LogRingBuffer> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn record(&self, line: String) {
        self.lock_logs().push(line);
    }

    async fn terminate(&self, termination: Termination, timeout: Duration) -> bool {
        let target = {
            let slot = self.slot.lock().await;
            slot.as_ref().map(|handle| {
                handle.respawn.store(false, Ordering::SeqCst);
                (handle.pid, handle.exited.clone(), handle.kill.clone())
            })
        };
        let Some((pid, mut exited, kill)) = target else {
            return true;
        };

        tracing::info!(pid, ?termination, "Terminating child");
        match termination {
            Termination::Graceful => {
                if !request_terminate(pid) {
                    kill.cancel();
                }
            }
            Termination::Forced => kill.cancel(),
        }

        let gone = tokio::time::timeout(timeout, exited.wait_for(|exited| *exited))
            .await
            .is_ok();
        if !gone {
            tracing::warn!(pid, ?timeout, "Child still running after timeout");
        }
        gone
    }

    /// Stop the current child, if any, then start a fresh one.
    ///
    /// Callers hold `spawn_lock`.
    async fn replace_child(self: Arc<Self>) -> Result<u32, SupervisorError> {
        let timeout = self.config.terminate_timeout();
        if !self.terminate(Termination::Graceful, timeout).await
            && !self.terminate(Termination::Forced, timeout).await
        {
            tracing::error!("Previous child is still running");
        }

        self.lock_logs().clear();
        let mut process = PresenceProcess::spawn(&self.spec)?;
        let (stdin, stdout, stderr) = process.take_pipes()?;
        let pid = process.id().unwrap_or_default();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (commands, _writer) = spawn_writer::<_, Command>(stdin);
        let pumps = vec![
            tokio::spawn(Arc::clone(&self).pump_stdout(stdout)),
            tokio::spawn(Arc::clone(&self).pump_stderr(stderr)),
        ];
        let (exited_tx, exited) = watch::channel(false);
        let kill = CancellationToken::new();
        let respawn = Arc::new(AtomicBool::new(true));

        {
            let mut slot = self.slot.lock().await;
            *slot = Some(ChildHandle {
                generation,
                pid,
                commands: commands.clone(),
                respawn: Arc::clone(&respawn),
                exited,
                kill: kill.clone(),
            });
            tokio::spawn(Arc::clone(&self).monitor(generation, process, kill, exited_tx, pumps));
        }

        tracing::info!(pid, generation, program = %self.spec.program().display(), "Child spawned");
        self.publish(SupervisorEvent::Spawned { pid });
        commands.send(Command::Login);
        Ok(pid)
    }

    async fn monitor(
        self: Arc<Self>,
        generation: u64,
        mut process: PresenceProcess,
        kill: CancellationToken,
        exited: watch::Sender<bool>,
        pumps: Vec<JoinHandle<()>>,
    ) {
        let status = tokio::select! {
            status = process.wait() => status,
            () = kill.cancelled() => process.kill().await,
        };
        let code = match &status {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to reap child");
                None
            }
        };
        for pump in pumps {
            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump).await;
        }

        let respawn = self.release(generation).await;
        let _ = exited.send(true);
        tracing::info!(generation, ?code, signal = signal_of(status.as_ref().ok()), "Child exited");
        self.publish(SupervisorEvent::Exited { code });

        if respawn {
            tracing::warn!(generation, "Child exited unexpectedly, respawning");
            self.respawn().await;
        }
    }

    /// Clear the slot if it still holds `generation`. Returns whether the
    /// child should be respawned.
    async fn release(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(handle) if handle.generation == generation => {
                let respawn = handle.respawn.load(Ordering::SeqCst);
                *slot = None;
                respawn && !self.shutdown.is_cancelled()
            }
            _ => false,
        }
    }

    /// Respawn until a child is running or the supervisor shuts down.
    fn respawn(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let _guard = self.spawn_lock.lock().await;
            loop {
                if self.shutdown.is_cancelled() || self.slot.lock().await.is_some() {
                    return;
                }
                match Arc::clone(&self).replace_child().await {
                    Ok(pid) => {
                        tracing::info!(pid, "Child respawned");
                        return;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, delay = ?self.config.respawn_delay(), "Respawn failed, retrying");
                        tokio::select! {
                            () = self.shutdown.cancelled() => return,
                            () = tokio::time::sleep(self.config.respawn_delay()) => {}
                        }
                    }
                }
            }
        })
    }

    async fn pump_stdout(self: Arc<Self>, stdout: ChildStdout) {
        let mut reader = IpcReader::<_, Event>::new(stdout);
        while let Some(incoming) = reader.next().await {
            match incoming {
                Incoming::Message(event) => {
                    tracing::info!(target: "child", "{event}");
                    self.record(event.to_string());
                    self.publish(SupervisorEvent::Child(event));
                }
                Incoming::Raw(line) => {
                    tracing::info!(target: "child", "{line}");
                    self.record(line.clone());
                    self.publish(SupervisorEvent::Output(line));
                }
            }
        }
    }

    async fn pump_stderr(self: Arc<Self>, stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    tracing::warn!(target: "child", "{line}");
                    self.record(line.clone());
                    self.publish(SupervisorEvent::Output(line));
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "Child stderr closed");
                    break;
                }
            }
        }
    }
}

#[cfg(unix)]
fn signal_of(status: Option<&ExitStatus>) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.and_then(ExitStatusExt::signal)
}

#[cfg(not(unix))]
fn signal_of(_status: Option<&ExitStatus>) -> Option<i32> {
    None
}
