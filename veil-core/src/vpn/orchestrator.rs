//! Connection orchestration state machine
//!
//! The orchestrator owns the single live connection attempt. Commands from
//! callers, status events from tunnel sessions and retry timers all arrive on
//! one queue and are applied in arrival order by one task, so no two
//! transitions ever run concurrently. Every tunnel event carries its attempt
//! identity; anything not matching the live attempt is discarded.

use crate::config::OrchestratorConfig;
use crate::error::{ErrorKind, VpnError};
use crate::types::{AttemptId, ConnectionIntent, Endpoint, UserEntitlement};
use crate::vpn::entitlement::{EntitlementChecker, EntitlementSource};
use crate::vpn::selector::{EndpointDirectory, EndpointSelector};
use crate::vpn::state::{ConnectionState, RetryReason, StateChange};
use crate::vpn::tunnel::{TunnelEvent, TunnelFactory, TunnelSession, TunnelStatus};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Automatic restarts allowed per attempt after an unreachable endpoint
pub const MAX_UNREACHABLE_RETRIES: u32 = 1;

type Reply<T> = oneshot::Sender<Result<T, VpnError>>;

/// Caller requests
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        intent: ConnectionIntent,
        reply: Reply<AttemptId>,
    },
    Cancel {
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Acknowledge {
        reply: Reply<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Everything the orchestrator task reacts to
#[derive(Debug)]
pub(crate) enum Envelope {
    Command(Command),
    Tunnel(TunnelEvent),
    RetryDue { attempt: AttemptId },
}

/// The live connection attempt
struct Attempt {
    id: AttemptId,
    intent: ConnectionIntent,
    endpoint: Endpoint,
    /// Snapshot taken when the intent arrived
    entitlement: UserEntitlement,
    session: TunnelSession,
    unreachable_count: u32,
}

/// Connection orchestrator; call `spawn()` to run it
pub struct Orchestrator {
    config: OrchestratorConfig,
    directory: Arc<dyn EndpointDirectory>,
    entitlement: Arc<dyn EntitlementSource>,
    tunnels: Arc<dyn TunnelFactory>,
}

/// State owned by the running orchestrator task
struct Actor {
    config: OrchestratorConfig,
    directory: Arc<dyn EndpointDirectory>,
    entitlement: Arc<dyn EntitlementSource>,
    tunnels: Arc<dyn TunnelFactory>,
    selector: EndpointSelector,
    checker: EntitlementChecker,
    /// Handles hold the only strong senders, so the queue closes with them
    queue_tx: mpsc::WeakUnboundedSender<Envelope>,
    queue_rx: mpsc::UnboundedReceiver<Envelope>,
    /// Commands that arrived while a teardown was blocking transitions
    deferred: VecDeque<Envelope>,
    events: broadcast::Sender<StateChange>,
    current: watch::Sender<StateChange>,
    attempt: Option<Attempt>,
    state: ConnectionState,
    last_id: AttemptId,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        directory: Arc<dyn EndpointDirectory>,
        entitlement: Arc<dyn EntitlementSource>,
        tunnels: Arc<dyn TunnelFactory>,
    ) -> Self {
        Self {
            config,
            directory,
            entitlement,
            tunnels,
        }
    }

    /// Run the orchestrator on a background task
    ///
    /// The task ends on `shutdown()`, or once every handle is dropped; either
    /// way the live attempt is torn down first.
    pub fn spawn(self) -> OrchestratorHandle {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(self.config.event_buffer.max(1));
        let (current, current_rx) = watch::channel(StateChange::idle());

        let actor = Actor {
            config: self.config,
            directory: self.directory,
            entitlement: self.entitlement,
            tunnels: self.tunnels,
            selector: EndpointSelector::new(),
            checker: EntitlementChecker::new(),
            queue_tx: queue_tx.downgrade(),
            queue_rx,
            deferred: VecDeque::new(),
            events: events.clone(),
            current,
            attempt: None,
            state: ConnectionState::Idle,
            last_id: AttemptId::default(),
        };
        tokio::spawn(actor.run());

        OrchestratorHandle {
            queue: queue_tx,
            events,
            current: current_rx,
        }
    }
}

impl Actor {
    async fn run(mut self) {
        info!("Connection orchestrator started");

        while let Some(envelope) = self.next_envelope().await {
            match envelope {
                Envelope::Command(command) => {
                    if !self.handle_command(command).await {
                        info!("Connection orchestrator stopped");
                        return;
                    }
                }
                Envelope::Tunnel(event) => self.handle_tunnel_event(event),
                Envelope::RetryDue { attempt } => self.handle_retry_due(attempt),
            }
        }

        if self.attempt.is_some() {
            info!(target: "conn.disconnect", reason = "orchestrator dropped", "trigger");
            self.teardown().await;
        }
        info!("Connection orchestrator stopped, all handles dropped");
    }

    async fn next_envelope(&mut self) -> Option<Envelope> {
        match self.deferred.pop_front() {
            Some(envelope) => Some(envelope),
            None => self.queue_rx.recv().await,
        }
    }

    /// Apply a caller request; returns `false` once shut down
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { intent, reply } => {
                let result = self.connect(intent).await;
                let _ = reply.send(result);
            }
            Command::Cancel { reply } => {
                let result = self.cancel().await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                let result = self.disconnect().await;
                let _ = reply.send(result);
            }
            Command::Acknowledge { reply } => {
                let _ = reply.send(self.acknowledge());
            }
            Command::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn connect(&mut self, intent: ConnectionIntent) -> Result<AttemptId, VpnError> {
        let id = self.last_id.next();
        self.last_id = id;
        info!(target: "conn.connect", attempt = %id, cause = %intent.cause, mode = %intent.mode, "trigger");

        let entitlement = self.entitlement.snapshot();

        info!(target: "conn.connect", attempt = %id, tier = %entitlement.tier, "scan");
        let endpoint = match self
            .selector
            .resolve(&intent, self.directory.as_ref(), &entitlement)
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(target: "conn.connect", attempt = %id, reason = %e, "scan_failed");
                return Err(self.reject(id, e.into(), None));
            }
        };
        info!(target: "conn.connect", attempt = %id, endpoint = %endpoint, score = endpoint.score, "scan_result");

        let decision = self.checker.check(&entitlement, &endpoint);
        if let Some(kind) = decision.into_error() {
            return Err(self.reject(id, kind, Some(endpoint)));
        }

        // Admitted: the previous attempt goes before the new one starts
        if self.attempt.is_some() {
            info!(target: "conn.disconnect", superseded_by = %id, "trigger");
            self.teardown().await;
        }

        self.publish(id, ConnectionState::ResolvingEndpoint, Some(endpoint.clone()));

        let mut session = TunnelSession::new(id, self.tunnels.create(), self.queue_tx.clone());
        if let Err(e) = session.start(&endpoint) {
            let kind = ErrorKind::TunnelFault(e.to_string());
            error!(target: "conn", attempt = %id, error = %e, "Tunnel failed to start");
            self.publish(id, ConnectionState::Error(kind.clone()), Some(endpoint));
            return Err(kind.into());
        }

        info!(target: "conn.connect", attempt = %id, endpoint = %endpoint, "start");
        self.attempt = Some(Attempt {
            id,
            intent,
            endpoint: endpoint.clone(),
            entitlement,
            session,
            unreachable_count: 0,
        });
        self.publish(id, ConnectionState::Connecting, Some(endpoint));

        Ok(id)
    }

    /// Short-circuit an intent without touching the live attempt
    fn reject(&mut self, id: AttemptId, kind: ErrorKind, endpoint: Option<Endpoint>) -> VpnError {
        match &kind {
            ErrorKind::RequiresUpgrade(feature) => {
                info!(target: "conn", attempt = %id, %feature, "Connection requires upgrade")
            }
            ErrorKind::ServerUnavailable => {
                info!(target: "conn", attempt = %id, "Server under maintenance")
            }
            other => warn!(target: "conn", attempt = %id, error = %other, "Connection intent failed"),
        }

        let change = StateChange::new(id, ConnectionState::Error(kind.clone()), endpoint);
        if self.attempt.is_some() {
            // Report the outcome of this intent only; the live attempt carries on
            let _ = self.events.send(change);
        } else {
            self.state = change.state.clone();
            self.current.send_replace(change.clone());
            let _ = self.events.send(change);
        }

        kind.into()
    }

    async fn cancel(&mut self) -> Result<(), VpnError> {
        if self.attempt.is_none() || !self.state.is_cancellable() {
            return Err(self.invalid("cancel"));
        }
        info!(target: "conn.disconnect", reason = "user cancel", "trigger");
        self.teardown().await;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), VpnError> {
        if self.attempt.is_none() {
            return Err(self.invalid("disconnect"));
        }
        info!(target: "conn.disconnect", reason = "user disconnect", "trigger");
        self.teardown().await;
        Ok(())
    }

    fn acknowledge(&mut self) -> Result<(), VpnError> {
        match self.state {
            ConnectionState::Error(_) => {
                let id = self.current.borrow().attempt;
                self.publish(id, ConnectionState::Idle, None);
                Ok(())
            }
            ConnectionState::Idle => Ok(()),
            _ => Err(self.invalid("acknowledge")),
        }
    }

    fn invalid(&self, action: &'static str) -> VpnError {
        debug!(state = %self.state, action, "Rejected command");
        VpnError::InvalidStateTransition {
            state: self.state.to_string(),
            action,
        }
    }

    /// Tear down the live attempt, blocking other transitions until the
    /// session confirms or the cancel timeout elapses
    async fn teardown(&mut self) {
        let Some(mut attempt) = self.attempt.take() else {
            return;
        };
        let was_connected = self.state == ConnectionState::Connected;
        self.publish(
            attempt.id,
            ConnectionState::Disconnecting,
            Some(attempt.endpoint.clone()),
        );

        if attempt.session.is_active() {
            if was_connected {
                attempt.session.stop();
            } else {
                attempt.session.cancel();
            }
            self.await_teardown(&mut attempt).await;
        }

        debug!(attempt = %attempt.id, cause = %attempt.intent.cause, "Attempt torn down");
        self.publish(attempt.id, ConnectionState::Idle, Some(attempt.endpoint));
    }

    async fn await_teardown(&mut self, attempt: &mut Attempt) {
        let deadline = Instant::now() + self.config.cancel_timeout();

        loop {
            match tokio::time::timeout_at(deadline, self.queue_rx.recv()).await {
                Ok(Some(Envelope::Tunnel(event))) if event.attempt == attempt.id => {
                    if event.status.is_terminal() {
                        debug!(attempt = %attempt.id, status = %event.status, "Tunnel teardown confirmed");
                        return;
                    }
                    trace!(attempt = %attempt.id, status = %event.status, "Discarding in-flight event during teardown");
                }
                Ok(Some(Envelope::Tunnel(event))) => self.discard(&event),
                Ok(Some(Envelope::RetryDue { attempt: stale })) => {
                    trace!(attempt = %stale, "Discarding retry timer during teardown");
                }
                Ok(Some(command)) => self.deferred.push_back(command),
                Ok(None) => return,
                Err(_) => {
                    warn!(
                        attempt = %attempt.id,
                        timeout_ms = self.config.cancel_timeout_ms,
                        "Tunnel did not confirm teardown, abandoning session"
                    );
                    attempt.session.abandon();
                    return;
                }
            }
        }
    }

    fn discard(&self, event: &TunnelEvent) {
        debug!(
            attempt = %event.attempt,
            handle = event.handle.0,
            status = %event.status,
            "Discarding event from stale attempt"
        );
    }

    fn handle_tunnel_event(&mut self, event: TunnelEvent) {
        let live = self
            .attempt
            .as_ref()
            .is_some_and(|a| a.id == event.attempt && a.session.handle() == event.handle);
        if !live {
            self.discard(&event);
            return;
        }

        match (self.state.clone(), event.status) {
            (_, TunnelStatus::Connecting) | (_, TunnelStatus::Disconnecting) => {
                trace!(attempt = %event.attempt, "Tunnel progress");
            }
            (ConnectionState::Connecting, TunnelStatus::Connected) => {
                info!(target: "conn.connect", attempt = %event.attempt, "connected");
                let endpoint = self.attempt.as_ref().map(|a| a.endpoint.clone());
                self.publish(event.attempt, ConnectionState::Connected, endpoint);
            }
            (ConnectionState::Connected, TunnelStatus::Connected) => {
                trace!(attempt = %event.attempt, "Duplicate connected event");
            }
            (ConnectionState::Connecting, TunnelStatus::Unreachable) => self.on_unreachable(),
            (ConnectionState::Connected, TunnelStatus::Unreachable) => {
                self.fail(ErrorKind::Unreachable)
            }
            (ConnectionState::Connecting, TunnelStatus::Disconnected) => self.fail(
                ErrorKind::TunnelFault("tunnel closed before connecting".to_string()),
            ),
            (ConnectionState::Connected, TunnelStatus::Disconnected) => {
                self.fail(ErrorKind::TunnelFault("connection lost".to_string()))
            }
            (_, TunnelStatus::Failed(reason)) => self.fail(ErrorKind::TunnelFault(reason)),
            (state, status) => {
                debug!(attempt = %event.attempt, %state, %status, "Ignoring tunnel event");
            }
        }
    }

    fn on_unreachable(&mut self) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        attempt.unreachable_count += 1;
        if attempt.unreachable_count > MAX_UNREACHABLE_RETRIES {
            self.fail(ErrorKind::Unreachable);
            return;
        }

        let (id, endpoint) = (attempt.id, attempt.endpoint.clone());
        let delay = self.config.retry_delay();
        info!(target: "conn", attempt = %id, retry_in_ms = self.config.retry_delay_ms, "Endpoint unreachable, retrying");
        self.publish(
            id,
            ConnectionState::Retrying(RetryReason::Unreachable),
            Some(endpoint),
        );

        let queue = self.queue_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                let _ = queue.send(Envelope::RetryDue { attempt: id });
            }
        });
    }

    fn handle_retry_due(&mut self, id: AttemptId) {
        let retrying = matches!(self.state, ConnectionState::Retrying(_));
        let Some(attempt) = self.attempt.as_mut().filter(|a| a.id == id && retrying) else {
            trace!(attempt = %id, "Discarding stale retry timer");
            return;
        };

        let endpoint = attempt.endpoint.clone();
        info!(
            target: "conn.connect",
            attempt = %id,
            endpoint = %endpoint,
            tier = %attempt.entitlement.tier,
            "start"
        );
        match attempt.session.start(&endpoint) {
            Ok(_) => self.publish(id, ConnectionState::Connecting, Some(endpoint)),
            Err(e) => self.fail(ErrorKind::TunnelFault(e.to_string())),
        }
    }

    /// End the live attempt with an error
    fn fail(&mut self, kind: ErrorKind) {
        let Some(mut attempt) = self.attempt.take() else {
            return;
        };
        // The primitive may still be running even after a terminal status
        attempt
            .session
            .release(self.state == ConnectionState::Connected);
        error!(target: "conn", attempt = %attempt.id, endpoint = %attempt.endpoint, error = %kind, "error");
        self.publish(attempt.id, ConnectionState::Error(kind), Some(attempt.endpoint));
    }

    fn publish(&mut self, attempt: AttemptId, state: ConnectionState, endpoint: Option<Endpoint>) {
        info!(target: "conn", attempt = %attempt, from = %self.state, to = %state, "state_change");
        self.state = state.clone();
        let change = StateChange::new(attempt, state, endpoint);
        self.current.send_replace(change.clone());
        // No subscribers is fine
        let _ = self.events.send(change);
    }
}

/// Cloneable entry point to a running orchestrator
///
/// Dropping the last handle tears down the live attempt and ends the task.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    queue: mpsc::UnboundedSender<Envelope>,
    events: broadcast::Sender<StateChange>,
    current: watch::Receiver<StateChange>,
}

impl OrchestratorHandle {
    /// Submit a connection intent
    ///
    /// Resolves once the attempt is admitted (`Connecting`) or rejected.
    pub async fn connect(&self, intent: ConnectionIntent) -> Result<AttemptId, VpnError> {
        self.request(|reply| Command::Connect { intent, reply }).await
    }

    /// Cancel an attempt that is still connecting or retrying
    pub async fn cancel(&self) -> Result<(), VpnError> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// Tear down the live attempt, whatever its phase
    pub async fn disconnect(&self) -> Result<(), VpnError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Clear a displayed error back to `Idle`
    pub async fn acknowledge(&self) -> Result<(), VpnError> {
        self.request(|reply| Command::Acknowledge { reply }).await
    }

    /// Tear down any live attempt and stop the orchestrator task
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .queue
            .send(Envelope::Command(Command::Shutdown { reply }))
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Stream of every transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Latest transition of the current attempt
    pub fn current(&self) -> StateChange {
        self.current.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.current.borrow().state.clone()
    }

    /// Watch channel over the latest transition
    pub fn watch(&self) -> watch::Receiver<StateChange> {
        self.current.clone()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, VpnError> {
        let (reply, response) = oneshot::channel();
        self.queue
            .send(Envelope::Command(make(reply)))
            .map_err(|_| VpnError::OrchestratorClosed)?;
        response.await.map_err(|_| VpnError::OrchestratorClosed)?
    }
}
