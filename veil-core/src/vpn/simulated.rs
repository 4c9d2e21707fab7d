//! In-process simulated tunnel
//!
//! A scripted tunnel primitive for dry runs (`veil connect --simulate`) and
//! tests. Each `start` consumes the next scripted outcome; when the script is
//! empty the tunnel connects.

use crate::error::VpnError;
use crate::types::Endpoint;
use crate::vpn::tunnel::{StatusSink, TunnelFactory, TunnelPrimitive, TunnelStatus};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// What a simulated `start` ends with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Connect,
    Unreachable,
    Fail(String),
    /// Never reports a result on its own
    Hang,
}

/// How the simulated tunnel reacts to cancel/stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Reports `Disconnecting` then `Disconnected`
    Confirm,
    /// Reports nothing, like a wedged tunnel client
    Unresponsive,
}

#[derive(Debug)]
struct Shared {
    delay: Duration,
    script: Mutex<VecDeque<Outcome>>,
    teardown: Mutex<Teardown>,
    sinks: Mutex<Vec<StatusSink>>,
    starts: AtomicUsize,
    cancels: AtomicUsize,
    stops: AtomicUsize,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Factory for simulated tunnels sharing one script and call log
#[derive(Debug, Clone)]
pub struct SimulatedTunnelFactory {
    shared: Arc<Shared>,
}

impl SimulatedTunnelFactory {
    /// `delay` is how long each start takes to report its outcome
    pub fn new(delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                delay,
                script: Mutex::new(VecDeque::new()),
                teardown: Mutex::new(Teardown::Confirm),
                sinks: Mutex::new(Vec::new()),
                starts: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue outcomes for upcoming starts, across all tunnels of this factory
    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) -> &Self {
        guard(&self.shared.script).extend(outcomes);
        self
    }

    pub fn set_teardown(&self, teardown: Teardown) -> &Self {
        *guard(&self.shared.teardown) = teardown;
        self
    }

    pub fn starts(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.shared.cancels.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.shared.stops.load(Ordering::SeqCst)
    }

    /// Emit a status on the sink of the `index`-th start (0-based)
    ///
    /// Returns whether the session forwarded it; `false` for unknown starts.
    pub fn emit(&self, index: usize, status: TunnelStatus) -> bool {
        let sink = guard(&self.shared.sinks).get(index).cloned();
        sink.is_some_and(|sink| sink.emit(status))
    }
}

impl TunnelFactory for SimulatedTunnelFactory {
    fn create(&self) -> Box<dyn TunnelPrimitive> {
        Box::new(SimulatedTunnel {
            shared: Arc::clone(&self.shared),
            sink: None,
            task: None,
        })
    }
}

struct SimulatedTunnel {
    shared: Arc<Shared>,
    sink: Option<StatusSink>,
    task: Option<JoinHandle<()>>,
}

impl SimulatedTunnel {
    fn tear_down(&mut self) {
        if *guard(&self.shared.teardown) == Teardown::Unresponsive {
            debug!("Simulated tunnel ignoring teardown request");
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(sink) = &self.sink {
            sink.emit(TunnelStatus::Disconnecting);
            sink.emit(TunnelStatus::Disconnected);
        }
    }
}

impl TunnelPrimitive for SimulatedTunnel {
    fn start(&mut self, endpoint: &Endpoint, sink: StatusSink) -> Result<(), VpnError> {
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        guard(&self.shared.sinks).push(sink.clone());

        let outcome = guard(&self.shared.script)
            .pop_front()
            .unwrap_or(Outcome::Connect);
        debug!(endpoint = %endpoint, ?outcome, "Simulated tunnel starting");

        sink.emit(TunnelStatus::Connecting);
        self.sink = Some(sink.clone());

        let status = match outcome {
            Outcome::Connect => TunnelStatus::Connected,
            Outcome::Unreachable => TunnelStatus::Unreachable,
            Outcome::Fail(reason) => TunnelStatus::Failed(reason),
            Outcome::Hang => return Ok(()),
        };
        let delay = self.shared.delay;
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.emit(status);
        }));
        Ok(())
    }

    fn cancel(&mut self) {
        self.shared.cancels.fetch_add(1, Ordering::SeqCst);
        self.tear_down();
    }

    fn stop(&mut self) {
        self.shared.stops.fetch_add(1, Ordering::SeqCst);
        self.tear_down();
    }
}
