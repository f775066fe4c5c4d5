//! Presence client state machine.
//!
//! A [`PresenceClient`] owns at most one live [`Connection`]. The connection
//! itself is driven by a session task; everything else (occupancy checks,
//! first messages, scheduled reconnects) runs on short-lived tasks that are
//! cancelled through tokens derived from the client's root token.
//!
//! Bookkeeping lives behind a synchronous mutex that is never held across an
//! await. Every transition that could race (a disconnect against an in-flight
//! connect, a remote end against an operator stop) is decided while holding
//! it, so the outcome is deterministic.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::connection::{ConnectError, Connection, ConnectionEvent, Connector, EventSink};
use super::state::{DisconnectReason, FollowUp, PresenceState};
use super::PresenceError;
use crate::config::{OccupancyPolicy, PresenceClientOptions};
use crate::ipc::Event;
use crate::probe::{Probe, ProbeError};

/// Handle to a presence client. Cheap to clone.
#[derive(Clone)]
pub struct PresenceClient {
    shared: Arc<Shared>,
}

struct Shared {
    id: Uuid,
    options: PresenceClientOptions,
    connector: Arc<dyn Connector>,
    probe: Arc<dyn Probe>,
    sink: Arc<dyn EventSink>,
    state: watch::Sender<PresenceState>,
    core: Mutex<Core>,
    shutdown: CancellationToken,
    next_session: AtomicU64,
    connect_attempts: AtomicU64,
    reconnect_attempts: AtomicU64,
}

#[derive(Default)]
struct Core {
    session: Option<Session>,
    /// In-flight connect attempt.
    attempt: Option<CancellationToken>,
    /// Scheduled reconnect or rejoin wait.
    pending: Option<CancellationToken>,
}

struct Session {
    id: u64,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl PresenceClient {
    #[must_use]
    pub fn new(
        options: PresenceClientOptions,
        connector: Arc<dyn Connector>,
        probe: Arc<dyn Probe>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (state, _) = watch::channel(PresenceState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                options,
                connector,
                probe,
                sink,
                state,
                core: Mutex::new(Core::default()),
                shutdown: CancellationToken::new(),
                next_session: AtomicU64::new(0),
                connect_attempts: AtomicU64::new(0),
                reconnect_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Identifier used in log lines.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    #[must_use]
    pub fn options(&self) -> &PresenceClientOptions {
        &self.shared.options
    }

    #[must_use]
    pub fn state(&self) -> PresenceState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PresenceState> {
        self.shared.state.subscribe()
    }

    /// Connect attempts made so far, including automatic ones.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Automatic and requested reconnects started so far.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u64 {
        self.shared.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Connect and, once joined, run the occupancy check.
    ///
    /// # Errors
    ///
    /// - [`PresenceError::InvalidOptions`] if the options are malformed
    /// - [`PresenceError::AlreadyConnected`] if a connection or attempt exists
    /// - [`PresenceError::Cancelled`] if a disconnect won the race
    /// - [`PresenceError::Connect`] if the attempt failed; the reconnect
    ///   policy has already been applied
    pub async fn connect(&self) -> Result<(), PresenceError> {
        self.begin_connect()?.await
    }

    /// Register a connect attempt now and return the future that drives it.
    ///
    /// A disconnect issued after this returns cancels the attempt, even if
    /// the returned future has not been polled yet.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect) for the checks made up front.
    pub fn begin_connect(
        &self,
    ) -> Result<impl Future<Output = Result<(), PresenceError>> + Send + 'static, PresenceError>
    {
        self.shared.options.validate()?;
        let attempt = self.shared.begin_attempt(None, false)?;
        Ok(Arc::clone(&self.shared).run_attempt(attempt))
    }

    /// Stop the client. No automatic reconnect follows.
    ///
    /// Cancels any in-flight attempt and any scheduled reconnect, then closes
    /// the connection and waits for it to be torn down.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::NotConnected`] if there was nothing to stop.
    pub async fn disconnect(&self) -> Result<(), PresenceError> {
        let shared = &self.shared;
        let session = {
            let mut core = shared.lock();
            let pending = core.pending.take();
            let attempt = core.attempt.take();
            let session = core.session.take();
            if session.is_none() && pending.is_none() && attempt.is_none() {
                return Err(PresenceError::NotConnected);
            }
            pending
                .iter()
                .chain(attempt.iter())
                .for_each(CancellationToken::cancel);
            shared.set_state(if session.is_some() {
                PresenceState::Disconnecting
            } else {
                PresenceState::Disconnected
            });
            session
        };

        match session {
            Some(session) => {
                session.cancel.cancel();
                let _ = session.task.await;
                shared.after_disconnect(DisconnectReason::RequestedStop, None);
            }
            None => {
                let reason = DisconnectReason::RequestedStop;
                tracing::info!(client = %shared.id, %reason, "Disconnected");
                shared.sink.emit(Event::Disconnected {
                    reason: reason.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Tear down the current connection and connect again after the
    /// configured reconnect delay. Returns as soon as the work is scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::ShutDown`] after [`shutdown`](Self::shutdown).
    pub fn reconnect(&self) -> Result<(), PresenceError> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(PresenceError::ShutDown);
        }
        let (session, pending) = {
            let mut core = shared.lock();
            if let Some(attempt) = core.attempt.take() {
                attempt.cancel();
            }
            let session = core.session.take();
            let pending = shared.shutdown.child_token();
            if let Some(previous) = core.pending.replace(pending.clone()) {
                previous.cancel();
            }
            shared.set_state(PresenceState::Reconnecting);
            (session, pending)
        };

        let previous = session.map(|session| {
            session.cancel.cancel();
            session.task
        });
        if previous.is_some() {
            shared.sink.emit(Event::Disconnected {
                reason: DisconnectReason::ReconnectRequested.to_string(),
            });
        }
        let delay = shared.options.reconnect_request_delay();
        tracing::info!(client = %shared.id, delay = ?delay, "Reconnect requested");
        tokio::spawn(Arc::clone(shared).reconnect_after(delay, pending, previous));
        Ok(())
    }

    /// Send a chat line through the live connection.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::NotConnected`] without a live connection.
    pub fn chat(&self, message: impl Into<String>) -> Result<(), PresenceError> {
        let core = self.shared.lock();
        let session = core.session.as_ref().ok_or(PresenceError::NotConnected)?;
        session
            .outbound
            .send(message.into())
            .map_err(|_| PresenceError::NotConnected)
    }

    /// Cancel all pending work and close the connection. Final.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let session = {
            let mut core = shared.lock();
            shared.shutdown.cancel();
            core.pending = None;
            core.attempt = None;
            core.session.take()
        };
        if let Some(session) = session {
            let _ = session.task.await;
        }
        shared.set_state(PresenceState::Disconnected);
        tracing::debug!(client = %shared.id, "Presence client shut down");
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: PresenceState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::debug!(client = %self.id, from = %current, to = %next, "State transition");
            *current = next;
            true
        });
    }

    /// Mark the client disconnected unless something new already started.
    fn settle(&self, core: &Core) {
        if core.session.is_none() && core.attempt.is_none() {
            self.set_state(PresenceState::Disconnected);
        }
    }

    fn begin_attempt(
        &self,
        pending: Option<&CancellationToken>,
        reconnecting: bool,
    ) -> Result<CancellationToken, PresenceError> {
        let attempt = {
            let mut core = self.lock();
            if self.shutdown.is_cancelled() {
                return Err(PresenceError::ShutDown);
            }
            if core.session.is_some() || core.attempt.is_some() {
                return Err(PresenceError::AlreadyConnected);
            }
            match pending {
                Some(token) if token.is_cancelled() => return Err(PresenceError::Cancelled),
                Some(_) => core.pending = None,
                None => {
                    if let Some(token) = core.pending.take() {
                        token.cancel();
                    }
                }
            }
            if reconnecting {
                self.set_state(PresenceState::Reconnecting);
                self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
            }
            let attempt = self.shutdown.child_token();
            core.attempt = Some(attempt.clone());
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            self.set_state(PresenceState::Connecting);
            attempt
        };
        if reconnecting {
            self.sink.emit(Event::Reconnecting);
        }
        tracing::info!(client = %self.id, address = %self.options.address(), "Connecting");
        Ok(attempt)
    }

    async fn run_attempt(self: Arc<Self>, attempt: CancellationToken) -> Result<(), PresenceError> {
        let result = tokio::select! {
            biased;
            () = attempt.cancelled() => return Err(PresenceError::Cancelled),
            result = self.connector.connect(&self.options) => result,
        };

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => return Err(self.attempt_failed(&attempt, e)),
        };

        let registered = {
            let mut core = self.lock();
            if attempt.is_cancelled() {
                Err(connection)
            } else {
                core.attempt = None;
                let id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
                let cancel = self.shutdown.child_token();
                let (outbound, outbound_rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(Arc::clone(&self).run_session(
                    id,
                    connection,
                    outbound_rx,
                    cancel.clone(),
                ));
                core.session = Some(Session {
                    id,
                    cancel: cancel.clone(),
                    outbound,
                    task,
                });
                let gate = self.options.occupancy_policy().cloned();
                if gate.is_some() {
                    self.set_state(PresenceState::OccupancyCheck);
                }
                Ok((id, cancel, gate))
            }
        };

        match registered {
            Err(mut connection) => {
                connection.close().await;
                Err(PresenceError::Cancelled)
            }
            Ok((id, cancel, Some(policy))) => {
                tokio::spawn(Arc::clone(&self).occupancy_gate(id, policy, cancel));
                Ok(())
            }
            Ok((id, _, None)) => {
                self.activate(id);
                Ok(())
            }
        }
    }

    fn attempt_failed(self: &Arc<Self>, attempt: &CancellationToken, err: ConnectError) -> PresenceError {
        let current = {
            let mut core = self.lock();
            let current = !attempt.is_cancelled();
            if current {
                core.attempt = None;
                self.settle(&core);
            }
            current
        };
        if !current {
            return PresenceError::Cancelled;
        }
        tracing::warn!(client = %self.id, error = %err, "Connect attempt failed");
        if !matches!(err, ConnectError::InvalidOptions(_)) {
            self.after_disconnect(err.disconnect_reason(), None);
        }
        PresenceError::Connect(err)
    }

    async fn run_session(
        self: Arc<Self>,
        id: u64,
        mut connection: Box<dyn Connection>,
        mut outbound: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    connection.close().await;
                    tracing::debug!(client = %self.id, session = id, "Connection closed");
                    return;
                }
                Some(message) = outbound.recv() => {
                    if let Err(e) = connection.send_chat(&message).await {
                        tracing::warn!(client = %self.id, error = %e, "Failed to send chat");
                    }
                }
                event = connection.next_event() => match event {
                    ConnectionEvent::Chat(message) => {
                        tracing::info!(client = %self.id, %message, "Chat received");
                        self.sink.emit(Event::ChatReceived { message });
                    }
                    ConnectionEvent::Ended(reason) => {
                        self.finish_session(id, reason);
                        return;
                    }
                },
            }
        }
    }

    /// End session `id` for `reason`. Stale ids are ignored.
    fn finish_session(self: &Arc<Self>, id: u64, reason: DisconnectReason) {
        let session = {
            let mut core = self.lock();
            if core.session.as_ref().map(|s| s.id) != Some(id) {
                return;
            }
            self.set_state(PresenceState::Disconnecting);
            core.session.take()
        };
        let Some(session) = session else { return };
        session.cancel.cancel();
        self.after_disconnect(reason, Some(session.task));
    }

    /// Settle into `Disconnected`, report, and schedule the follow-up.
    ///
    /// `previous` is the torn-down session task; a scheduled connect waits
    /// for it before creating a new connection.
    fn after_disconnect(self: &Arc<Self>, reason: DisconnectReason, previous: Option<JoinHandle<()>>) {
        let follow_up = reason.follow_up(
            self.options.reconnect_delay().is_some(),
            self.options.occupancy_policy().is_some(),
        );
        let pending = {
            let mut core = self.lock();
            self.settle(&core);
            if follow_up == FollowUp::None || self.shutdown.is_cancelled() {
                None
            } else {
                let token = self.shutdown.child_token();
                if let Some(old) = core.pending.replace(token.clone()) {
                    old.cancel();
                }
                Some(token)
            }
        };

        tracing::info!(client = %self.id, %reason, "Disconnected");
        self.sink.emit(Event::Disconnected {
            reason: reason.to_string(),
        });

        let Some(pending) = pending else { return };
        match follow_up {
            FollowUp::Reconnect => {
                let delay = self.options.reconnect_delay().unwrap_or_default();
                tracing::info!(client = %self.id, delay = ?delay, "Reconnect scheduled");
                tokio::spawn(Arc::clone(self).reconnect_after(delay, pending, previous));
            }
            FollowUp::RejoinWhenEmpty => {
                if let Some(policy) = self.options.occupancy_policy().cloned() {
                    tokio::spawn(Arc::clone(self).rejoin_when_empty(policy, pending, previous));
                }
            }
            FollowUp::None => {}
        }
    }

    fn activate(self: &Arc<Self>, id: u64) {
        let session = {
            let core = self.lock();
            match core.session.as_ref() {
                Some(session) if session.id == id => {
                    self.set_state(PresenceState::Active);
                    Some((session.cancel.clone(), session.outbound.clone()))
                }
                _ => None,
            }
        };
        let Some((cancel, outbound)) = session else { return };

        tracing::info!(client = %self.id, address = %self.options.address(), "Presence client active");
        self.sink.emit(Event::Ready);

        let (messages, delay) = self.options.first_message_script();
        if !messages.is_empty() {
            tokio::spawn(send_first_messages(
                messages.to_vec(),
                delay,
                outbound,
                cancel.clone(),
            ));
        }
        if let Some(policy) = self.options.occupancy_policy().cloned() {
            tokio::spawn(Arc::clone(self).monitor_occupancy(id, policy, cancel));
        }
    }

    async fn online_count(&self, policy: &OccupancyPolicy) -> Result<u32, ProbeError> {
        self.probe
            .ping(&self.options.host, self.options.port, policy.probe_timeout())
            .await
            .map(|status| status.online)
    }

    /// Decide whether a fresh session may stay. Our own join is already
    /// counted by the server, so it is discounted.
    async fn occupancy_gate(self: Arc<Self>, id: u64, policy: OccupancyPolicy, cancel: CancellationToken) {
        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                result = self.online_count(&policy) => result,
            };
            match result {
                Ok(online) => {
                    let others = online.saturating_sub(1);
                    if others == 0 {
                        self.activate(id);
                    } else {
                        tracing::info!(client = %self.id, others, "Server is not empty, leaving");
                        self.finish_session(id, DisconnectReason::NotEmpty);
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(client = %self.id, error = %e, "Occupancy check failed, retrying");
                }
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(policy.poll_interval()) => {}
            }
        }
    }

    /// Leave as soon as someone else joins. Probe failures are ignored.
    async fn monitor_occupancy(self: Arc<Self>, id: u64, policy: OccupancyPolicy, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(policy.poll_interval()) => {}
            }
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                result = self.online_count(&policy) => result,
            };
            match result {
                Ok(online) if online.saturating_sub(1) > 0 => {
                    tracing::info!(client = %self.id, online, "Someone joined, leaving");
                    self.finish_session(id, DisconnectReason::NotEmpty);
                    return;
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(client = %self.id, error = %e, "Occupancy probe failed"),
            }
        }
    }

    /// Poll until the server is empty, then rejoin.
    async fn rejoin_when_empty(
        self: Arc<Self>,
        policy: OccupancyPolicy,
        pending: CancellationToken,
        previous: Option<JoinHandle<()>>,
    ) {
        if let Some(task) = previous {
            tokio::select! {
                biased;
                () = pending.cancelled() => return,
                _ = task => {}
            }
        }
        loop {
            tokio::select! {
                biased;
                () = pending.cancelled() => return,
                () = tokio::time::sleep(policy.poll_interval()) => {}
            }
            let result = tokio::select! {
                biased;
                () = pending.cancelled() => return,
                result = self.online_count(&policy) => result,
            };
            match result {
                Ok(0) => break,
                Ok(online) => tracing::debug!(client = %self.id, online, "Server still occupied"),
                Err(e) => tracing::debug!(client = %self.id, error = %e, "Occupancy probe failed"),
            }
        }
        tracing::info!(client = %self.id, "Server is empty, rejoining");
        self.resume(pending).await;
    }

    async fn reconnect_after(
        self: Arc<Self>,
        delay: Duration,
        pending: CancellationToken,
        previous: Option<JoinHandle<()>>,
    ) {
        let wait = async move {
            if let Some(task) = previous {
                let _ = task.await;
            }
            tokio::time::sleep(delay).await;
        };
        tokio::select! {
            biased;
            () = pending.cancelled() => return,
            () = wait => {}
        }
        self.resume(pending).await;
    }

    async fn resume(self: Arc<Self>, pending: CancellationToken) {
        match self.begin_attempt(Some(&pending), true) {
            Ok(attempt) => {
                let id = self.id;
                if let Err(e) = self.run_attempt(attempt).await {
                    tracing::debug!(client = %id, error = %e, "Reconnect attempt ended");
                }
            }
            Err(e) => tracing::debug!(client = %self.id, error = %e, "Scheduled reconnect skipped"),
        }
    }
}

async fn send_first_messages(
    messages: Vec<String>,
    delay: Duration,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    for (index, message) in messages.into_iter().enumerate() {
        if index > 0 {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() || outbound.send(message).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FirstMessages, ReconnectPolicy};
    use crate::probe::PingResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize};
    use tokio::time::Instant;

    #[derive(Default)]
    struct StubProbe {
        online: AtomicU32,
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Probe for StubProbe {
        async fn ping(
            &self,
            _host: &str,
            _port: u16,
            _timeout: Duration,
        ) -> Result<PingResult, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProbeError::Timeout(5000));
            }
            Ok(PingResult {
                online: self.online.load(Ordering::SeqCst),
                max: 20,
                motd: String::new(),
                version: String::new(),
                latency: Duration::ZERO,
                modern: true,
            })
        }
    }

    /// Server side of a stub connection.
    #[derive(Clone)]
    struct Remote {
        events: mpsc::UnboundedSender<ConnectionEvent>,
        sent: Arc<Mutex<Vec<(Instant, String)>>>,
        closed: Arc<AtomicBool>,
    }

    impl Remote {
        fn sent(&self) -> Vec<(Instant, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    struct StubConnection {
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        remote: Remote,
    }

    #[async_trait]
    impl Connection for StubConnection {
        async fn next_event(&mut self) -> ConnectionEvent {
            match self.events.recv().await {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }

        async fn send_chat(&mut self, message: &str) -> Result<(), ConnectError> {
            self.remote
                .sent
                .lock()
                .unwrap()
                .push((Instant::now(), message.to_string()));
            Ok(())
        }

        async fn close(&mut self) {
            self.remote.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct StubConnector {
        calls: AtomicUsize,
        failures_left: AtomicUsize,
        hang: AtomicBool,
        remotes: Mutex<Vec<Remote>>,
    }

    impl StubConnector {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn remote(&self, index: usize) -> Remote {
            self.remotes.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl Connector for StubConnector {
        async fn connect(
            &self,
            _options: &PresenceClientOptions,
        ) -> Result<Box<dyn Connection>, ConnectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ConnectError::Io(std::io::Error::from(
                    std::io::ErrorKind::ConnectionRefused,
                )));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let remote = Remote {
                events: tx,
                sent: Arc::default(),
                closed: Arc::default(),
            };
            self.remotes.lock().unwrap().push(remote.clone());
            Ok(Box::new(StubConnection { events: rx, remote }))
        }
    }

    struct Harness {
        client: PresenceClient,
        connector: Arc<StubConnector>,
        probe: Arc<StubProbe>,
        events: mpsc::UnboundedReceiver<Event>,
    }

    impl Harness {
        fn new(options: PresenceClientOptions) -> Self {
            let connector = Arc::new(StubConnector::default());
            let probe = Arc::new(StubProbe::default());
            let (tx, events) = mpsc::unbounded_channel();
            let client = PresenceClient::new(
                options,
                Arc::clone(&connector) as Arc<dyn Connector>,
                Arc::clone(&probe) as Arc<dyn Probe>,
                Arc::new(tx),
            );
            Self {
                client,
                connector,
                probe,
                events,
            }
        }

        fn drain(&mut self) -> Vec<Event> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        async fn wait_for(&self, state: PresenceState) {
            let mut rx = self.client.subscribe();
            rx.wait_for(|s| *s == state).await.unwrap();
        }
    }

    fn options() -> PresenceClientOptions {
        PresenceClientOptions::new("h", 1)
    }

    fn with_reconnect(delay_ms: u64) -> PresenceClientOptions {
        let mut options = options();
        options.reconnect = Some(ReconnectPolicy {
            enabled: true,
            delay_ms,
        });
        options
    }

    fn with_occupancy() -> PresenceClientOptions {
        let mut options = options();
        options.occupancy = Some(OccupancyPolicy::default());
        options
    }

    fn disconnected(reason: &str) -> Event {
        Event::Disconnected {
            reason: reason.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_is_rejected() {
        let h = Harness::new(options());
        h.client.connect().await.unwrap();
        assert_eq!(h.client.state(), PresenceState::Active);

        assert!(matches!(
            h.client.connect().await,
            Err(PresenceError::AlreadyConnected)
        ));
        assert_eq!(h.connector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_options_never_reach_the_connector() {
        let h = Harness::new(PresenceClientOptions::new("", 1));
        assert!(matches!(
            h.client.connect().await,
            Err(PresenceError::InvalidOptions(_))
        ));
        assert_eq!(h.connector.calls(), 0);
        assert_eq!(h.client.state(), PresenceState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_server_activates_and_sends_first_messages_in_order() {
        let mut options = with_occupancy();
        options.first_messages = Some(FirstMessages {
            messages: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            delay_ms: 1000,
        });
        let mut h = Harness::new(options);
        // Only the client itself is online.
        h.probe.online.store(1, Ordering::SeqCst);

        h.client.connect().await.unwrap();
        h.wait_for(PresenceState::Active).await;
        assert_eq!(h.drain(), vec![Event::Ready]);

        let remote = h.connector.remote(0);
        while remote.sent().len() < 3 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let sent = remote.sent();
        let texts: Vec<&str> = sent.iter().map(|(_, m)| m.as_str()).collect();
        assert_eq!(texts, ["a", "b", "c"]);
        for pair in sent.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_mid_sequence_stops_first_messages() {
        let mut options = options();
        options.first_messages = Some(FirstMessages {
            messages: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            delay_ms: 1000,
        });
        let h = Harness::new(options);
        h.client.connect().await.unwrap();
        let remote = h.connector.remote(0);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.client.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let texts: Vec<String> = remote.sent().into_iter().map(|(_, m)| m).collect();
        assert_eq!(texts, ["a", "b"]);
        assert!(remote.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn occupied_server_is_left_and_rejoined_once_empty() {
        let mut h = Harness::new(with_occupancy());
        h.probe.online.store(3, Ordering::SeqCst);

        h.client.connect().await.unwrap();
        h.wait_for(PresenceState::Disconnected).await;
        assert_eq!(h.drain(), vec![disconnected("notEmpty")]);

        // Still occupied: the rejoin loop keeps waiting.
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(h.connector.remote(0).closed.load(Ordering::SeqCst));
        assert_eq!(h.connector.calls(), 1);
        assert_eq!(h.client.state(), PresenceState::Disconnected);

        h.probe.online.store(0, Ordering::SeqCst);
        h.wait_for(PresenceState::Active).await;
        assert_eq!(h.connector.calls(), 2);
        assert_eq!(h.client.reconnect_attempts(), 1);
        assert_eq!(h.drain(), vec![Event::Reconnecting, Event::Ready]);
    }

    #[tokio::test(start_paused = true)]
    async fn someone_joining_an_active_session_makes_the_client_leave() {
        let mut h = Harness::new(with_occupancy());
        h.probe.online.store(1, Ordering::SeqCst);
        h.client.connect().await.unwrap();
        h.wait_for(PresenceState::Active).await;

        h.probe.online.store(2, Ordering::SeqCst);
        h.wait_for(PresenceState::Disconnected).await;
        assert_eq!(h.drain(), vec![Event::Ready, disconnected("notEmpty")]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_occupancy_probe_is_retried() {
        let h = Harness::new(with_occupancy());
        h.probe.failing.store(true, Ordering::SeqCst);
        h.client.connect().await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.client.state(), PresenceState::OccupancyCheck);
        assert!(h.probe.calls.load(Ordering::SeqCst) >= 3);

        h.probe.failing.store(false, Ordering::SeqCst);
        h.probe.online.store(1, Ordering::SeqCst);
        h.wait_for(PresenceState::Active).await;
    }

    #[tokio::test(start_paused = true)]
    async fn requested_stop_never_reconnects() {
        let mut h = Harness::new(with_reconnect(100));
        h.client.connect().await.unwrap();

        h.client.disconnect().await.unwrap();
        assert_eq!(h.client.state(), PresenceState::Disconnected);
        assert!(h.connector.remote(0).closed.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.connector.calls(), 1);
        assert_eq!(
            h.drain(),
            vec![Event::Ready, disconnected("requested stop")]
        );

        assert!(matches!(
            h.client.disconnect().await,
            Err(PresenceError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unclassified_end_reconnects_after_the_delay() {
        let h = Harness::new(with_reconnect(100));
        h.client.connect().await.unwrap();

        h.connector
            .remote(0)
            .events
            .send(ConnectionEvent::Ended(DisconnectReason::Unknown(
                "socketClosed".to_string(),
            )))
            .unwrap();
        h.wait_for(PresenceState::Disconnected).await;
        let ended_at = Instant::now();

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(h.client.state(), PresenceState::Disconnected);
        assert_eq!(h.connector.calls(), 1);

        h.wait_for(PresenceState::Active).await;
        assert!(ended_at.elapsed() >= Duration::from_millis(100));
        assert_eq!(h.connector.calls(), 2);
        assert_eq!(h.client.reconnect_attempts(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.connector.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_reconnect_stays_disconnected() {
        let mut options = with_reconnect(100);
        if let Some(policy) = options.reconnect.as_mut() {
            policy.enabled = false;
        }
        let h = Harness::new(options);
        h.client.connect().await.unwrap();

        h.connector
            .remote(0)
            .events
            .send(ConnectionEvent::Ended(DisconnectReason::RemoteKick(
                "bye".to_string(),
            )))
            .unwrap();
        h.wait_for(PresenceState::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.connector.calls(), 1);
        assert_eq!(h.client.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_applies_reconnect_policy() {
        let h = Harness::new(with_reconnect(100));
        h.connector.failures_left.store(1, Ordering::SeqCst);

        assert!(matches!(
            h.client.connect().await,
            Err(PresenceError::Connect(ConnectError::Io(_)))
        ));
        h.wait_for(PresenceState::Active).await;
        assert_eq!(h.connector.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_wins_the_race_with_connect() {
        let mut h = Harness::new(with_reconnect(100));
        h.connector.hang.store(true, Ordering::SeqCst);

        let attempt = tokio::spawn(h.client.begin_connect().unwrap());
        while h.connector.calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.client.state(), PresenceState::Connecting);

        h.client.disconnect().await.unwrap();
        assert!(matches!(
            attempt.await.unwrap(),
            Err(PresenceError::Cancelled)
        ));
        assert_eq!(h.client.state(), PresenceState::Disconnected);
        assert_eq!(h.drain(), vec![disconnected("requested stop")]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.connector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_the_reconnect_wait_is_reported() {
        let mut h = Harness::new(with_reconnect(1000));
        h.connector.failures_left.store(1, Ordering::SeqCst);
        assert!(h.client.connect().await.is_err());
        h.drain();

        h.client.disconnect().await.unwrap();
        assert_eq!(h.client.state(), PresenceState::Disconnected);
        assert_eq!(h.drain(), vec![disconnected("requested stop")]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.connector.calls(), 1);
        assert!(h.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_before_the_attempt_runs_cancels_it() {
        let h = Harness::new(options());
        let attempt = h.client.begin_connect().unwrap();
        h.client.disconnect().await.unwrap();

        assert!(matches!(attempt.await, Err(PresenceError::Cancelled)));
        assert_eq!(h.connector.calls(), 0);
        assert_eq!(h.client.state(), PresenceState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_reconnect_tears_down_before_connecting() {
        let mut h = Harness::new(with_reconnect(100));
        h.client.connect().await.unwrap();

        h.client.reconnect().unwrap();
        assert_eq!(h.client.state(), PresenceState::Reconnecting);
        h.wait_for(PresenceState::Active).await;

        assert!(h.connector.remote(0).closed.load(Ordering::SeqCst));
        assert!(!h.connector.remote(1).closed.load(Ordering::SeqCst));
        assert_eq!(
            h.drain(),
            vec![
                Event::Ready,
                disconnected("reconnect"),
                Event::Reconnecting,
                Event::Ready
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn chat_flows_both_ways() {
        let mut h = Harness::new(options());
        assert!(matches!(
            h.client.chat("early"),
            Err(PresenceError::NotConnected)
        ));

        h.client.connect().await.unwrap();
        h.client.chat("hello").unwrap();
        let remote = h.connector.remote(0);
        remote
            .events
            .send(ConnectionEvent::Chat("<Steve> hi".to_string()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(remote.sent()[0].1, "hello");
        assert_eq!(
            h.drain(),
            vec![
                Event::Ready,
                Event::ChatReceived {
                    message: "<Steve> hi".to_string()
                }
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_the_rejoin_wait() {
        let h = Harness::new(with_occupancy());
        h.probe.online.store(4, Ordering::SeqCst);
        h.client.connect().await.unwrap();
        h.wait_for(PresenceState::Disconnected).await;

        h.client.shutdown().await;
        let probes = h.probe.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.probe.calls.load(Ordering::SeqCst), probes);
        assert_eq!(h.connector.calls(), 1);
        assert!(matches!(h.client.connect().await, Err(PresenceError::ShutDown)));
    }
}
