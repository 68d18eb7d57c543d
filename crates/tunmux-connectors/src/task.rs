//! Connector handle backed by a tokio task

use bytes::{Bytes, BytesMut};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use tunmux_connection::{ConnectionHandler, Connector};
use tunmux_proto::Address;

pub(crate) const READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug)]
pub(crate) enum ConnectorCommand {
    Send(Option<Address>, Bytes),
    Close,
}

pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<ConnectorCommand>;

/// Sends that arrived while the target was still being opened
pub(crate) type Queued = Vec<(Option<Address>, Bytes)>;

/// Connector whose I/O runs in a spawned task
///
/// `send` and `close` only queue a command, so the remote endpoint never waits
/// on the target.
#[derive(Debug)]
pub struct TaskConnector {
    commands: mpsc::UnboundedSender<ConnectorCommand>,
    datagram: bool,
}

impl TaskConnector {
    /// Spawn `task` with the receiving end of the command queue
    pub(crate) fn spawn<F, Fut>(task: F) -> Box<dyn Connector>
    where
        F: FnOnce(CommandReceiver) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::start(task, false)
    }

    /// Like [`spawn`](Self::spawn), for a task that needs whole datagrams
    pub(crate) fn spawn_datagram<F, Fut>(task: F) -> Box<dyn Connector>
    where
        F: FnOnce(CommandReceiver) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::start(task, true)
    }

    fn start<F, Fut>(task: F, datagram: bool) -> Box<dyn Connector>
    where
        F: FnOnce(CommandReceiver) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(task(rx));
        Box::new(TaskConnector { commands, datagram })
    }
}

impl Connector for TaskConnector {
    fn send(&mut self, address: Option<Address>, data: Bytes) {
        if self.commands.send(ConnectorCommand::Send(address, data)).is_err() {
            trace!("Connector task finished, data dropped");
        }
    }

    fn close(&mut self) {
        let _ = self.commands.send(ConnectorCommand::Close);
    }

    fn is_datagram(&self) -> bool {
        self.datagram
    }
}

/// Drive `connect` while watching the command queue
///
/// Sends arriving meanwhile are kept in `queued`. Returns `None` without
/// finishing `connect` when a `Close` arrives or the queue ends first.
pub(crate) async fn connect_or_close<F, T>(
    connect: F,
    commands: &mut CommandReceiver,
    queued: &mut Queued,
) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::pin!(connect);

    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(ConnectorCommand::Send(address, data)) => queued.push((address, data)),
                Some(ConnectorCommand::Close) | None => {
                    debug!("Connector closed while connecting");
                    return None;
                }
            },
            result = &mut connect => return Some(result),
        }
    }
}

/// Shuttle bytes between a connected stream and the tunnel
///
/// Reports `connected` first, then `received` per read, and ends with exactly
/// one of `closed` (EOF from the target) or `failed`. A `Close` command ends
/// the pump without reporting anything. `queued` is written before anything
/// else.
pub(crate) async fn pump_stream<S>(
    stream: S,
    queued: Queued,
    mut commands: CommandReceiver,
    mut handler: Box<dyn ConnectionHandler>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handler.connected();

    let (mut reader, mut writer) = tokio::io::split(stream);
    for (_, data) in queued {
        if let Err(e) = writer.write_all(&data).await {
            handler.failed(e.into());
            return;
        }
    }
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        buf.reserve(READ_BUFFER_SIZE);
        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!("Target closed the connection");
                    handler.closed();
                    break;
                }
                Ok(n) => {
                    trace!("Read {} bytes from target", n);
                    handler.received(None, buf.split().freeze());
                }
                Err(e) => {
                    handler.failed(e.into());
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(ConnectorCommand::Send(_, data)) => {
                    if let Err(e) = writer.write_all(&data).await {
                        handler.failed(e.into());
                        break;
                    }
                }
                Some(ConnectorCommand::Close) | None => {
                    let _ = writer.shutdown().await;
                    break;
                }
            },
        }
    }
}
