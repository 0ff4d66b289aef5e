//! Kernel processes.
//!
//! `ProcessKernel` starts a kernel from its spec, hands it a connection file
//! and talks to it through a [`Transport`]. Every request waits on one
//! message channel with an optional deadline. On timeout the kernel is
//! interrupted, given a grace period to reply, and killed if it stays silent.

use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;

use crate::error::{Error, Result};

use super::collect::{OutputCollector, WidgetState, kernel_error};
use super::connection::ConnectionInfo;
use super::protocol::{
    ExecuteReplyContent, ExecuteRequestContent, Message, interrupt_request, kernel_info_request,
    shutdown_request,
};
use super::spec::{KernelSpec, find_kernel_spec_in, kernel_search_paths};
use super::transport::{Channel, Transport, ZmqTransport};
use super::{ExecuteOptions, ExecuteReply, Kernel, KernelInfo, KernelLauncher, STARTUP_TIMEOUT};

/// Grace period after an interrupt before the kernel is killed.
pub const DEFAULT_INTERRUPT_GRACE: Duration = Duration::from_secs(3);

/// Time allowed for a kernel to acknowledge shutdown and exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Time allowed for trailing broadcasts once a reply arrived.
const IOPUB_GRACE: Duration = Duration::from_secs(4);

/// Interval between handshake requests while iopub is not yet subscribed.
const HANDSHAKE_RETRY: Duration = Duration::from_secs(1);

/// Longest wait on the channel before checking the process is alive.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Instant `timeout` from now.
///
/// `None` means no deadline, either because there is no timeout or because
/// the deadline is not representable.
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

fn timeout_secs(timeout: Option<Duration>) -> u64 {
    timeout.map_or(0, |t| t.as_secs())
}

/// A kernel process reached through a transport.
pub struct ProcessKernel {
    /// The kernel process, absent for transport-only kernels.
    child: Option<Child>,
    transport: Box<dyn Transport>,
    messages: Receiver<Result<Message>>,
    session: String,
    widgets: WidgetState,
    interrupt_grace: Duration,
    interrupt_by_message: bool,
    /// Holds the connection file for the kernel's lifetime.
    _runtime_dir: Option<TempDir>,
    dead: bool,
    shut_down: bool,
}

impl ProcessKernel {
    /// Kernel speaking over `transport`, whose replies arrive on `messages`.
    pub fn from_transport(
        transport: impl Transport + 'static,
        messages: Receiver<Result<Message>>,
    ) -> Self {
        Self {
            child: None,
            transport: Box::new(transport),
            messages,
            session: uuid::Uuid::new_v4().to_string(),
            widgets: WidgetState::default(),
            interrupt_grace: DEFAULT_INTERRUPT_GRACE,
            interrupt_by_message: false,
            _runtime_dir: None,
            dead: false,
            shut_down: false,
        }
    }

    /// Start the kernel described by `spec` in `cwd` and connect to it.
    pub fn spawn(spec: &KernelSpec, cwd: &Path, connect_timeout: Duration) -> Result<Self> {
        let runtime_dir = tempfile::Builder::new().prefix("folio-kernel-").tempdir()?;
        let info = ConnectionInfo::allocate(&spec.name)?;
        let connection_file = runtime_dir
            .path()
            .join(format!("kernel-{}.json", uuid::Uuid::new_v4()));
        info.write(&connection_file)?;

        let mut child = spec
            .command(&connection_file)?
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Kernel(format!("Failed to start kernel {:?}: {}", spec.name, e)))?;
        tracing::debug!("Started kernel {:?} (pid {}) in {}", spec.name, child.id(), cwd.display());

        let (sender, messages) = mpsc::channel();
        let transport = match ZmqTransport::connect(&info, sender, connect_timeout) {
            Ok(transport) => transport,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        let mut kernel = Self::from_transport(transport, messages);
        kernel.child = Some(child);
        kernel.interrupt_by_message = !spec.interrupts_by_signal();
        kernel._runtime_dir = Some(runtime_dir);
        Ok(kernel)
    }

    /// Set the grace period between interrupt and kill.
    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }

    /// Interrupt with an `interrupt_request` instead of SIGINT.
    pub fn with_message_interrupts(mut self, enabled: bool) -> Self {
        self.interrupt_by_message = enabled;
        self
    }

    /// Process id of the kernel, if it runs as a child process.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn send(&mut self, channel: Channel, message: &Message) -> Result<()> {
        if self.dead {
            return Err(Error::KernelDied("kernel is no longer running".to_string()));
        }
        self.transport.send(channel, message).inspect_err(|_| self.dead = true)
    }

    /// Fails once the kernel process has exited.
    fn check_alive(&mut self) -> Result<()> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.dead = true;
                Err(Error::KernelDied(format!("kernel exited ({})", status)))
            }
            Ok(None) => Ok(()),
            Err(e) => {
                tracing::debug!("Cannot query kernel process: {}", e);
                Ok(())
            }
        }
    }

    /// Next message, waiting until `deadline` (forever when `None`).
    fn recv_until(&mut self, deadline: Option<Instant>) -> Result<Option<Message>> {
        loop {
            let slice = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(POLL_INTERVAL),
                None => POLL_INTERVAL,
            };
            match self.messages.recv_timeout(slice) {
                Ok(Ok(message)) => return Ok(Some(message)),
                Ok(Err(e)) => {
                    self.dead = true;
                    return Err(match e {
                        Error::KernelDied(_) => e,
                        other => Error::KernelDied(other.to_string()),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.check_alive()?;
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Ok(None);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.dead = true;
                    return Err(Error::KernelDied("kernel channels closed".to_string()));
                }
            }
        }
    }

    /// Wait for the reply to `request`, feeding broadcasts to `on_broadcast`.
    ///
    /// With `await_idle`, broadcasts keep being collected after the reply
    /// until the kernel reports idle for the request, or for `IOPUB_GRACE`.
    fn wait_reply(
        &mut self,
        request: &Message,
        reply_type: &str,
        deadline: Option<Instant>,
        await_idle: bool,
        mut on_broadcast: impl FnMut(&Message, &mut WidgetState),
    ) -> Result<Option<Message>> {
        let msg_id = request.header.msg_id.clone();
        let mut deadline = deadline;
        let mut reply = None;
        let mut idle = !await_idle;

        while reply.is_none() || !idle {
            let Some(message) = self.recv_until(deadline)? else {
                if reply.is_some() {
                    tracing::debug!("Kernel did not report idle after {}", reply_type);
                    break;
                }
                return Ok(None);
            };
            if message.parent_id() != Some(msg_id.as_str()) {
                tracing::trace!("Dropping unrelated kernel message {}", message.msg_type());
                continue;
            }
            if message.msg_type() == reply_type {
                reply = Some(message);
                deadline = deadline_after(Some(IOPUB_GRACE));
            } else if message.msg_type() == "status" {
                if message.content_str("execution_state") == Some("idle") {
                    idle = true;
                }
            } else {
                on_broadcast(&message, &mut self.widgets);
            }
        }
        Ok(reply)
    }

    /// Interrupt the running request.
    fn interrupt(&mut self) {
        if self.interrupt_by_message {
            let request = interrupt_request(&self.session);
            if let Err(e) = self.send(Channel::Control, &request) {
                tracing::warn!("Failed to send interrupt request: {}", e);
            }
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid() {
            // SAFETY: signalling our own child process.
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
        }
    }

    /// Kill the kernel process immediately.
    fn kill(&mut self) {
        self.dead = true;
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill()
                && e.kind() != std::io::ErrorKind::InvalidInput
            {
                tracing::warn!("Failed to kill kernel: {}", e);
            }
            let _ = child.wait();
        }
    }

    /// Wait up to `grace` for the process to exit, then kill it.
    fn reap(&mut self, grace: Duration) {
        if let Some(child) = self.child.as_mut() {
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline {
                match child.try_wait() {
                    Ok(Some(_)) => return,
                    Ok(None) => thread::sleep(Duration::from_millis(20)),
                    Err(_) => break,
                }
            }
        }
        self.kill();
    }

    /// Handle an expired request: interrupt, wait for the grace period, kill.
    fn on_timeout(&mut self, request: &Message, timeout: Option<Duration>) -> Error {
        tracing::warn!("Kernel request timed out after {:?}; interrupting", timeout);
        self.interrupt();
        let grace = deadline_after(Some(self.interrupt_grace));
        match self.wait_reply(request, "execute_reply", grace, false, |_, _| {}) {
            Ok(Some(_)) => tracing::debug!("Kernel recovered after interrupt"),
            _ => {
                tracing::warn!("Kernel did not respond to interrupt; killing it");
                self.kill();
            }
        }
        Error::KernelTimeout {
            seconds: timeout_secs(timeout),
        }
    }
}

impl Kernel for ProcessKernel {
    fn kernel_info(&mut self, timeout: Option<Duration>) -> Result<KernelInfo> {
        // Requests are repeated until iopub carries a status for one of them,
        // so no broadcast of the first cell is lost to a late subscription.
        let deadline = deadline_after(timeout);
        let mut sent: Vec<String> = Vec::new();
        let mut reply: Option<Message> = None;
        let mut iopub_ready = false;

        while reply.is_none() || !iopub_ready {
            let request = kernel_info_request(&self.session);
            sent.push(request.header.msg_id.clone());
            self.send(Channel::Shell, &request)?;

            let retry = Instant::now() + HANDSHAKE_RETRY;
            let retry = deadline.map_or(retry, |deadline| deadline.min(retry));
            while let Some(message) = self.recv_until(Some(retry))? {
                let ours = message
                    .parent_id()
                    .is_some_and(|parent| sent.iter().any(|id| id == parent));
                if !ours {
                    continue;
                }
                if message.msg_type() == "status" {
                    iopub_ready = true;
                } else if message.msg_type() == "kernel_info_reply" && reply.is_none() {
                    reply = Some(message);
                }
                if reply.is_some() && iopub_ready {
                    break;
                }
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }
        }

        let reply = reply.ok_or(Error::KernelTimeout {
            seconds: timeout_secs(timeout),
        })?;
        if !iopub_ready {
            tracing::debug!("No iopub status received during the kernel handshake");
        }

        Ok(KernelInfo {
            language_info: reply
                .content
                .get("language_info")
                .and_then(|v| v.as_object())
                .cloned(),
            implementation: reply.content_str("implementation").map(str::to_string),
        })
    }

    fn execute(
        &mut self,
        code: &str,
        options: ExecuteOptions,
        timeout: Option<Duration>,
    ) -> Result<ExecuteReply> {
        let mut content = ExecuteRequestContent::new(code);
        content.store_history = options.store_history;
        content.stop_on_error = options.stop_on_error;
        let request = content.into_message(&self.session)?;
        self.send(Channel::Shell, &request)?;

        let deadline = deadline_after(timeout);
        let mut collector = OutputCollector::new();
        let reply = self.wait_reply(&request, "execute_reply", deadline, true, |message, widgets| {
            collector.handle(message, widgets)
        })?;
        let Some(reply) = reply else {
            return Err(self.on_timeout(&request, timeout));
        };

        let reply: ExecuteReplyContent = serde_json::from_value(reply.content)
            .map_err(|e| Error::Deserialization(format!("Invalid execute_reply: {}", e)))?;
        let (outputs, broadcast_error) = collector.into_outputs();
        let error = if reply.is_ok() {
            None
        } else {
            // Prefer the broadcast error, it carries the full traceback.
            broadcast_error.or_else(|| {
                Some(kernel_error(&json!({
                    "ename": reply.ename.clone().unwrap_or_else(|| reply.status.clone()),
                    "evalue": reply.evalue.clone().unwrap_or_default(),
                    "traceback": reply.traceback.clone().unwrap_or_default(),
                })))
            })
        };

        Ok(ExecuteReply {
            execution_count: reply.execution_count,
            outputs,
            error,
        })
    }

    fn widget_state(&self) -> Option<serde_json::Value> {
        self.widgets.to_value()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        if !self.dead {
            let request = shutdown_request(&self.session);
            if self.send(Channel::Control, &request).is_ok() {
                let deadline = deadline_after(Some(SHUTDOWN_GRACE));
                if let Ok(None) = self.wait_reply(&request, "shutdown_reply", deadline, false, |_, _| {}) {
                    tracing::debug!("Kernel did not acknowledge shutdown");
                }
            }
        }

        self.reap(SHUTDOWN_GRACE);
        Ok(())
    }
}

impl Drop for ProcessKernel {
    fn drop(&mut self) {
        // Ensure the kernel is gone when the handle is dropped
        let _ = self.shutdown();
    }
}

/// Launches kernels from kernel specs.
#[derive(Debug, Clone)]
pub struct ProcessKernelLauncher {
    search_paths: Vec<PathBuf>,
    interrupt_grace: Duration,
    startup_timeout: Duration,
}

impl Default for ProcessKernelLauncher {
    fn default() -> Self {
        Self {
            search_paths: kernel_search_paths(),
            interrupt_grace: DEFAULT_INTERRUPT_GRACE,
            startup_timeout: STARTUP_TIMEOUT,
        }
    }
}

impl ProcessKernelLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Search only the given roots for kernel specs.
    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }

    /// Time allowed for a started kernel to accept connections.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }
}

impl KernelLauncher for ProcessKernelLauncher {
    fn launch(&self, kernel_name: &str, cwd: &Path) -> Result<Box<dyn Kernel>> {
        let spec = find_kernel_spec_in(kernel_name, &self.search_paths)?;
        let kernel = ProcessKernel::spawn(&spec, cwd, self.startup_timeout)?
            .with_interrupt_grace(self.interrupt_grace);
        Ok(Box::new(kernel))
    }
}
