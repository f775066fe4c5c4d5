//! Liveness watchdog.
//!
//! Samples a scalar describing the parent's own network link on a fixed
//! interval. `threshold` identical samples in a row mean the link looks
//! alive but is not making progress, and the whole process is terminated
//! so the outer process manager can restart it.
//!
//! The watchdog runs on its own OS thread with a private runtime, so a
//! stalled supervisor runtime cannot stop it from ticking.

use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::config::WatchdogConfig;

/// Errors that can occur when starting the watchdog.
#[derive(thiserror::Error, Debug)]
pub enum WatchdogError {
    #[error("Watchdog threshold must be at least 1")]
    InvalidThreshold,
    #[error("Failed to start watchdog thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// A liveness metric of the local network link.
#[async_trait]
pub trait LivenessSource: Send {
    /// Take one sample. Implementations must return within a bounded time.
    async fn sample(&mut self) -> u64;
}

/// Measures the TCP connect round trip to `target`, in microseconds.
///
/// A failed or timed-out connect repeats the previous sample, so an outage
/// counts toward the stall threshold.
#[derive(Debug, Clone)]
pub struct TcpRoundTrip {
    target: String,
    timeout: Duration,
    last: u64,
}

impl TcpRoundTrip {
    #[must_use]
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
            last: 0,
        }
    }
}

#[async_trait]
impl LivenessSource for TcpRoundTrip {
    async fn sample(&mut self) -> u64 {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(self.target.as_str())).await {
            Ok(Ok(_stream)) => {
                self.last = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
            }
            Ok(Err(e)) => {
                tracing::debug!(target_addr = %self.target, error = %e, "Liveness sample failed");
            }
            Err(_) => {
                tracing::debug!(target_addr = %self.target, "Liveness sample timed out");
            }
        }
        self.last
    }
}

/// Outcome of one watchdog tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The sample differs from the previous one.
    Progress,
    /// The sample repeated; `count` identical samples in a row so far.
    Repeated { count: u32 },
    /// `threshold` identical samples in a row.
    Stalled,
}

/// Sample/streak pair driven by [`Watchdog::tick`].
pub struct Watchdog<S> {
    source: S,
    threshold: u32,
    previous: Option<u64>,
    streak: u32,
}

impl<S: LivenessSource> Watchdog<S> {
    /// # Errors
    ///
    /// Returns [`WatchdogError::InvalidThreshold`] for a zero threshold.
    pub fn new(source: S, threshold: u32) -> Result<Self, WatchdogError> {
        if threshold == 0 {
            return Err(WatchdogError::InvalidThreshold);
        }
        Ok(Self {
            source,
            threshold,
            previous: None,
            streak: 0,
        })
    }

    /// Identical samples in a row, counting the first of the run.
    #[must_use]
    pub fn streak(&self) -> u32 {
        self.streak
    }

    /// Take one sample and update the streak.
    pub async fn tick(&mut self) -> Tick {
        let sample = self.source.sample().await;
        if self.previous == Some(sample) {
            self.streak = self.streak.saturating_add(1);
        } else {
            self.streak = 1;
        }
        self.previous = Some(sample);

        if self.streak >= self.threshold {
            Tick::Stalled
        } else if self.streak == 1 {
            Tick::Progress
        } else {
            Tick::Repeated {
                count: self.streak,
            }
        }
    }

    /// Tick every `interval` until a stall, then run `on_stall`.
    ///
    /// Returns early when `stop` fires or its sender is dropped.
    pub async fn run<F>(
        mut self,
        interval: Duration,
        stop: tokio::sync::oneshot::Receiver<()>,
        on_stall: F,
    ) where
        F: FnOnce(),
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => return,
                _ = ticker.tick() => {}
            }

            match self.tick().await {
                Tick::Progress => {}
                Tick::Repeated { count } => {
                    tracing::debug!(count, threshold = self.threshold, "Liveness sample repeated");
                }
                Tick::Stalled => {
                    tracing::error!(
                        threshold = self.threshold,
                        "Network link stalled, terminating process"
                    );
                    on_stall();
                    return;
                }
            }
        }
    }
}

/// Running watchdog thread. Dropping the handle stops it.
pub struct WatchdogHandle {
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WatchdogHandle {
    /// Stop the watchdog and wait for its thread.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Watchdog thread panicked");
            }
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Start the watchdog described by `config` on a dedicated thread.
///
/// A stall terminates the process with exit code 1.
///
/// # Errors
///
/// Returns an error if the threshold is zero or the thread cannot start.
pub fn spawn(config: &WatchdogConfig) -> Result<WatchdogHandle, WatchdogError> {
    let source = TcpRoundTrip::new(config.target.clone(), config.sample_timeout());
    spawn_with(source, config.threshold, config.interval(), || std::process::exit(1))
}

/// Start a watchdog over any source with a custom stall action.
///
/// # Errors
///
/// Returns an error if the threshold is zero or the thread cannot start.
pub fn spawn_with<S, F>(
    source: S,
    threshold: u32,
    interval: Duration,
    on_stall: F,
) -> Result<WatchdogHandle, WatchdogError>
where
    S: LivenessSource + 'static,
    F: FnOnce() + Send + 'static,
{
    let watchdog = Watchdog::new(source, threshold)?;
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    let (ready_tx, ready_rx) = std_mpsc::channel();

    let thread = thread::Builder::new()
        .name("watchdog".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            runtime.block_on(watchdog.run(interval, stop_rx, on_stall));
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(WatchdogError::Thread(e)),
        Err(_) => {
            return Err(WatchdogError::Thread(std::io::Error::other(
                "watchdog thread exited during startup",
            )))
        }
    }

    tracing::info!(?interval, threshold, "Watchdog started");
    Ok(WatchdogHandle {
        stop_tx: Some(stop_tx),
        thread: Some(thread),
    })
}
