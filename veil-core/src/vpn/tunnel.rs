//! Tunnel session adapter
//!
//! Wraps an opaque tunnel primitive for one connection attempt. Status events
//! from the primitive are tagged with the attempt identity and handle, gated,
//! and forwarded into the orchestrator's transition queue. They are never
//! applied from the primitive's own task.

use crate::error::VpnError;
use crate::types::{AttemptId, Endpoint};
use crate::vpn::orchestrator::Envelope;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Status reported by a tunnel primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Unreachable,
    Failed(String),
}

impl TunnelStatus {
    /// Terminal statuses end a handle; nothing is accepted after them
    ///
    /// A primitive emits one only after the work behind the handle has
    /// stopped, since nothing tears the handle down once it is reported.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TunnelStatus::Disconnected | TunnelStatus::Unreachable | TunnelStatus::Failed(_)
        )
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelStatus::Connecting => write!(f, "connecting"),
            TunnelStatus::Connected => write!(f, "connected"),
            TunnelStatus::Disconnecting => write!(f, "disconnecting"),
            TunnelStatus::Disconnected => write!(f, "disconnected"),
            TunnelStatus::Unreachable => write!(f, "unreachable"),
            TunnelStatus::Failed(kind) => write!(f, "failed: {}", kind),
        }
    }
}

/// One `start` call within a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct HandleId(pub u32);

/// Status event tagged with its origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEvent {
    pub attempt: AttemptId,
    pub handle: HandleId,
    pub status: TunnelStatus,
    pub at: DateTime<Utc>,
}

/// The opaque tunnel mechanism
///
/// `start` only kicks off work; completion arrives through `sink`. All
/// methods are called from the orchestrator task and must not block.
///
/// Before emitting a terminal status the primitive must have stopped its
/// own work: no process, socket or task may outlive it. `cancel` and `stop`
/// may still be called afterwards and are then no-ops.
pub trait TunnelPrimitive: Send + 'static {
    fn start(&mut self, endpoint: &Endpoint, sink: StatusSink) -> Result<(), VpnError>;

    /// Abort an in-flight start
    fn cancel(&mut self);

    /// Graceful teardown of an established tunnel
    fn stop(&mut self);
}

/// Creates a fresh primitive for every attempt
pub trait TunnelFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn TunnelPrimitive>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unstarted,
    Active,
    Cancelling,
    Terminal,
}

#[derive(Debug)]
struct Gate {
    handle: HandleId,
    phase: Phase,
}

fn lock(gate: &Mutex<Gate>) -> MutexGuard<'_, Gate> {
    gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Event sink handed to a primitive for a single handle
///
/// Drops events from superseded handles, drops `Connected` once a cancel was
/// requested, and drops everything after the handle's terminal event.
#[derive(Debug, Clone)]
pub struct StatusSink {
    attempt: AttemptId,
    handle: HandleId,
    gate: Arc<Mutex<Gate>>,
    queue: mpsc::WeakUnboundedSender<Envelope>,
}

impl StatusSink {
    /// Report a status; returns whether it was forwarded
    pub fn emit(&self, status: TunnelStatus) -> bool {
        let mut gate = lock(&self.gate);

        if gate.handle != self.handle {
            trace!(attempt = %self.attempt, %status, "Dropping event from superseded handle");
            return false;
        }
        match gate.phase {
            Phase::Unstarted | Phase::Terminal => {
                trace!(attempt = %self.attempt, %status, "Dropping event after terminal status");
                return false;
            }
            Phase::Cancelling if status == TunnelStatus::Connected => {
                debug!(attempt = %self.attempt, "Dropping connected event after cancel");
                return false;
            }
            _ => {}
        }
        if status.is_terminal() {
            gate.phase = Phase::Terminal;
        }

        // Sent under the lock so queue order matches gate order
        let event = TunnelEvent {
            attempt: self.attempt,
            handle: self.handle,
            status,
            at: Utc::now(),
        };
        match self.queue.upgrade() {
            Some(queue) => queue.send(Envelope::Tunnel(event)).is_ok(),
            None => false,
        }
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }
}

/// Tunnel lifecycle for one connection attempt
pub struct TunnelSession {
    attempt: AttemptId,
    primitive: Box<dyn TunnelPrimitive>,
    gate: Arc<Mutex<Gate>>,
    queue: mpsc::WeakUnboundedSender<Envelope>,
}

impl TunnelSession {
    /// Sinks hold `queue` weakly and go quiet once the orchestrator is gone
    pub(crate) fn new(
        attempt: AttemptId,
        primitive: Box<dyn TunnelPrimitive>,
        queue: mpsc::WeakUnboundedSender<Envelope>,
    ) -> Self {
        Self {
            attempt,
            primitive,
            gate: Arc::new(Mutex::new(Gate {
                handle: HandleId::default(),
                phase: Phase::Unstarted,
            })),
            queue,
        }
    }

    /// Start the tunnel towards `endpoint` under a new handle
    pub fn start(&mut self, endpoint: &Endpoint) -> Result<HandleId, VpnError> {
        let handle = {
            let mut gate = lock(&self.gate);
            if matches!(gate.phase, Phase::Active | Phase::Cancelling) {
                return Err(VpnError::TunnelAlreadyActive);
            }
            gate.handle = HandleId(gate.handle.0 + 1);
            gate.phase = Phase::Active;
            gate.handle
        };

        let sink = StatusSink {
            attempt: self.attempt,
            handle,
            gate: Arc::clone(&self.gate),
            queue: self.queue.clone(),
        };

        // The gate lock is released: primitives may emit from inside start
        if let Err(e) = self.primitive.start(endpoint, sink) {
            lock(&self.gate).phase = Phase::Terminal;
            return Err(e);
        }
        debug!(attempt = %self.attempt, handle = handle.0, endpoint = %endpoint, "Tunnel start requested");
        Ok(handle)
    }

    /// Request teardown of an in-flight start
    pub fn cancel(&mut self) {
        let in_flight = {
            let mut gate = lock(&self.gate);
            match gate.phase {
                Phase::Active => {
                    gate.phase = Phase::Cancelling;
                    true
                }
                Phase::Cancelling => true,
                Phase::Unstarted | Phase::Terminal => false,
            }
        };
        if in_flight {
            self.primitive.cancel();
        }
    }

    /// Graceful teardown of an established tunnel
    pub fn stop(&mut self) {
        if self.is_active() {
            self.primitive.stop();
        }
    }

    /// Tear the primitive down without waiting for confirmation
    ///
    /// Used when the attempt ends on an error: the gate is closed first, so
    /// the teardown's own events are dropped.
    pub fn release(&mut self, connected: bool) {
        self.abandon();
        if connected {
            self.primitive.stop();
        } else {
            self.primitive.cancel();
        }
    }

    /// Stop listening to this session; anything it emits later is dropped
    pub fn abandon(&mut self) {
        lock(&self.gate).phase = Phase::Terminal;
    }

    /// Whether the current handle has yet to report a terminal status
    pub fn is_active(&self) -> bool {
        matches!(lock(&self.gate).phase, Phase::Active | Phase::Cancelling)
    }

    pub fn handle(&self) -> HandleId {
        lock(&self.gate).handle
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }
}
