//! Process-backed tunnel primitive
//!
//! Runs an external tunnel client per start, classifies its output with
//! `OutputParser`, and tears it down with SIGTERM. A fatal line is reported
//! only once the client has exited.

use crate::config::TunnelConfig;
use crate::error::VpnError;
use crate::types::Endpoint;
use crate::vpn::output_parser::OutputParser;
use crate::vpn::tunnel::{StatusSink, TunnelFactory, TunnelPrimitive, TunnelStatus};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long output readers may lag behind the process exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Time a client gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Pid of one spawned client, cleared once the client is reaped
type PidSlot = Arc<Mutex<Option<u32>>>;

fn running_pid(slot: &PidSlot) -> Option<u32> {
    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn clear_pid(slot: &PidSlot) {
    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
}

/// Creates a `CommandTunnel` per attempt from the configured client
pub struct CommandTunnelFactory {
    config: TunnelConfig,
    parser: Arc<OutputParser>,
}

impl CommandTunnelFactory {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            parser: Arc::new(OutputParser::new()),
        }
    }
}

impl TunnelFactory for CommandTunnelFactory {
    fn create(&self) -> Box<dyn TunnelPrimitive> {
        Box::new(CommandTunnel {
            config: self.config.clone(),
            parser: Arc::clone(&self.parser),
            child: PidSlot::default(),
        })
    }
}

/// How the exit watcher's wait ended
enum Watched {
    Exited(io::Result<ExitStatus>),
    Fatal(TunnelStatus),
}

/// One external tunnel client process at a time
pub struct CommandTunnel {
    config: TunnelConfig,
    parser: Arc<OutputParser>,
    /// Slot of the most recent start
    child: PidSlot,
}

impl CommandTunnel {
    /// Arguments with `{host}` substituted
    fn args_for(&self, endpoint: &Endpoint) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|arg| arg.replace("{host}", &endpoint.host))
            .collect()
    }

    /// Forward classified lines of one output stream
    ///
    /// Terminal statuses go to the exit watcher instead of the sink.
    fn monitor<R>(
        parser: Arc<OutputParser>,
        stream: R,
        sink: StatusSink,
        fatal: mpsc::UnboundedSender<TunnelStatus>,
        label: &'static str,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("Tunnel {}: {}", label, line);
                match parser.parse_line(&line) {
                    Some(status) if status.is_terminal() => {
                        let _ = fatal.send(status);
                    }
                    Some(status) => {
                        sink.emit(status);
                    }
                    None => {}
                }
            }
        })
    }

    /// SIGTERM the client, escalating to SIGKILL after the grace period
    async fn stop_child(child: &mut Child) -> io::Result<ExitStatus> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            info!("Sending SIGTERM to tunnel process {}", pid);
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Failed to send SIGTERM: {}", e);
            }
        }
        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!("Tunnel process ignored SIGTERM, killing it");
                child.kill().await?;
                child.wait().await
            }
        }
    }

    /// Send SIGTERM to the running client
    fn terminate(&mut self) -> Result<(), VpnError> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = running_pid(&self.child) else {
            return Ok(());
        };
        let pid = Pid::from_raw(pid as i32);

        // Already gone: the exit watcher reports the terminal status
        if kill(pid, None).is_err() {
            info!("Tunnel process {} already terminated", pid);
            return Ok(());
        }

        info!("Sending SIGTERM to tunnel process {}", pid);
        kill(pid, Signal::SIGTERM).map_err(|e| {
            warn!("Failed to send SIGTERM: {}", e);
            VpnError::TerminationError
        })
    }
}

impl TunnelPrimitive for CommandTunnel {
    fn start(&mut self, endpoint: &Endpoint, sink: StatusSink) -> Result<(), VpnError> {
        if let Some(pid) = running_pid(&self.child) {
            warn!("Tunnel process {} still running, terminating it first", pid);
            self.terminate()?;
        }

        let mut child = Command::new(&self.config.program)
            .args(self.args_for(endpoint))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VpnError::ProcessSpawnError {
                reason: format!("Failed to spawn {}: {}", self.config.program, e),
            })?;

        let slot = PidSlot::new(Mutex::new(child.id()));
        self.child = Arc::clone(&slot);
        info!(
            "Spawned tunnel process {:?} for {} ({})",
            child.id(),
            endpoint,
            endpoint.host
        );
        sink.emit(TunnelStatus::Connecting);

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(Self::monitor(
                Arc::clone(&self.parser),
                stdout,
                sink.clone(),
                fatal_tx.clone(),
                "stdout",
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(Self::monitor(
                Arc::clone(&self.parser),
                stderr,
                sink.clone(),
                fatal_tx,
                "stderr",
            ));
        }

        // Exit watcher owns the child; the sink keeps only the first terminal status
        tokio::spawn(async move {
            let watched = tokio::select! {
                exit = child.wait() => Watched::Exited(exit),
                Some(status) = fatal_rx.recv() => Watched::Fatal(status),
            };
            let (exit, mut fatal) = match watched {
                Watched::Exited(exit) => (exit, None),
                Watched::Fatal(status) => {
                    info!("Tunnel client reported {}, stopping it", status);
                    (Self::stop_child(&mut child).await, Some(status))
                }
            };
            clear_pid(&slot);

            // Classify the last lines before reporting the exit itself
            for reader in readers {
                let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
            }
            if fatal.is_none() {
                fatal = fatal_rx.try_recv().ok();
            }
            let status = fatal.unwrap_or_else(|| match exit {
                Ok(exit) if exit.success() => TunnelStatus::Disconnected,
                // Killed by our SIGTERM
                Ok(exit) if exit.code().is_none() => TunnelStatus::Disconnected,
                Ok(exit) => TunnelStatus::Failed(format!("tunnel client exited with {}", exit)),
                Err(e) => TunnelStatus::Failed(format!("failed to wait for tunnel client: {}", e)),
            });
            debug!("Tunnel process exited: {}", status);
            sink.emit(status);
        });

        Ok(())
    }

    fn cancel(&mut self) {
        if let Err(e) = self.terminate() {
            warn!("Cancelling tunnel start failed: {}", e);
        }
    }

    fn stop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!("Stopping tunnel failed: {}", e);
        }
    }
}
