//! Kernel sockets.
//!
//! [`ZmqTransport`] connects to a kernel's shell, control and iopub sockets.
//! The sockets live on a small tokio runtime owned by the transport; every
//! decoded message, whatever its socket, is forwarded into one std channel so
//! the synchronous [`ProcessKernel`](super::ProcessKernel) can wait on it with
//! a deadline.

use std::sync::mpsc::Sender;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use zeromq::{DealerSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use crate::error::{Error, Result};

use super::connection::ConnectionInfo;
use super::protocol::Message;
use super::wire::{Signer, decode, encode};

/// Pause between connection attempts while the kernel starts up.
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Request sockets of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Shell,
    Control,
}

/// Sends requests to a kernel.
///
/// Replies and broadcasts arrive on the channel handed to the transport when
/// it was created.
pub trait Transport: Send {
    fn send(&mut self, channel: Channel, message: &Message) -> Result<()>;
}

/// Transport over the Jupyter ZeroMQ sockets.
pub struct ZmqTransport {
    runtime: Option<Runtime>,
    shell: UnboundedSender<ZmqMessage>,
    control: UnboundedSender<ZmqMessage>,
    signer: Signer,
}

impl ZmqTransport {
    /// Connect to the kernel described by `info`, retrying until `timeout`.
    pub fn connect(
        info: &ConnectionInfo,
        incoming: Sender<Result<Message>>,
        timeout: Duration,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("folio-kernel-io")
            .enable_all()
            .build()?;
        let signer = Signer::new(&info.key);

        let (shell_socket, control_socket, iopub_socket) = runtime.block_on(async {
            let deadline = tokio::time::Instant::now() + timeout;
            let mut shell = DealerSocket::new();
            connect_with_retry(&mut shell, &info.endpoint(info.shell_port), deadline).await?;
            let mut control = DealerSocket::new();
            connect_with_retry(&mut control, &info.endpoint(info.control_port), deadline).await?;
            let mut iopub = SubSocket::new();
            connect_with_retry(&mut iopub, &info.endpoint(info.iopub_port), deadline).await?;
            iopub
                .subscribe("")
                .await
                .map_err(|e| Error::Kernel(format!("Failed to subscribe to iopub: {}", e)))?;
            Ok::<_, Error>((shell, control, iopub))
        })?;

        let (shell, shell_queue) = unbounded_channel();
        let (control, control_queue) = unbounded_channel();
        runtime.spawn(pump_dealer("shell", shell_socket, shell_queue, incoming.clone(), signer.clone()));
        runtime.spawn(pump_dealer("control", control_socket, control_queue, incoming.clone(), signer.clone()));
        runtime.spawn(read_iopub(iopub_socket, incoming, signer.clone()));

        Ok(Self {
            runtime: Some(runtime),
            shell,
            control,
            signer,
        })
    }
}

impl Transport for ZmqTransport {
    fn send(&mut self, channel: Channel, message: &Message) -> Result<()> {
        let frames = to_zmq(encode(message, &self.signer)?);
        let queue = match channel {
            Channel::Shell => &self.shell,
            Channel::Control => &self.control,
        };
        queue
            .send(frames)
            .map_err(|_| Error::KernelDied(format!("{:?} channel closed", channel)))
    }
}

impl Drop for ZmqTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn connect_with_retry(
    socket: &mut impl Socket,
    endpoint: &str,
    deadline: tokio::time::Instant,
) -> Result<()> {
    loop {
        let attempt = tokio::time::timeout_at(deadline, socket.connect(endpoint)).await;
        match attempt {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) if tokio::time::Instant::now() + CONNECT_RETRY < deadline => {
                tracing::trace!("Kernel not reachable at {} yet: {}", endpoint, e);
                tokio::time::sleep(CONNECT_RETRY).await;
            }
            Ok(Err(e)) => {
                return Err(Error::Kernel(format!("Failed to connect to kernel at {}: {}", endpoint, e)));
            }
            Err(_) => {
                return Err(Error::Kernel(format!("Timed out connecting to kernel at {}", endpoint)));
            }
        }
    }
}

/// Forward queued requests to a dealer socket and its replies to `incoming`.
async fn pump_dealer(
    name: &'static str,
    mut socket: DealerSocket,
    mut queue: UnboundedReceiver<ZmqMessage>,
    incoming: Sender<Result<Message>>,
    signer: Signer,
) {
    loop {
        tokio::select! {
            request = queue.recv() => {
                let Some(request) = request else { break };
                if let Err(e) = socket.send(request).await {
                    let _ = incoming.send(Err(Error::KernelDied(format!("{} send failed: {}", name, e))));
                    break;
                }
            }
            reply = socket.recv() => {
                match reply {
                    Ok(reply) => {
                        if !forward(reply, &incoming, &signer) {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = incoming.send(Err(Error::KernelDied(format!("{} receive failed: {}", name, e))));
                        break;
                    }
                }
            }
        }
    }
}

async fn read_iopub(mut socket: SubSocket, incoming: Sender<Result<Message>>, signer: Signer) {
    loop {
        match socket.recv().await {
            Ok(message) => {
                if !forward(message, &incoming, &signer) {
                    break;
                }
            }
            Err(e) => {
                let _ = incoming.send(Err(Error::KernelDied(format!("iopub receive failed: {}", e))));
                break;
            }
        }
    }
}

/// Decode and pass on one message. False once the receiver is gone.
fn forward(message: ZmqMessage, incoming: &Sender<Result<Message>>, signer: &Signer) -> bool {
    match decode(&message.into_vec(), signer) {
        Ok(message) => incoming.send(Ok(message)).is_ok(),
        Err(e) => {
            tracing::warn!("Dropping kernel message: {}", e);
            true
        }
    }
}

fn to_zmq(frames: Vec<Bytes>) -> ZmqMessage {
    let mut frames = frames.into_iter();
    let mut message = ZmqMessage::from(frames.next().unwrap_or_default());
    for frame in frames {
        message.push_back(frame);
    }
    message
}
