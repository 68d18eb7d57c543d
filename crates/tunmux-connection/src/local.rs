//! Local (originating) multiplexer endpoint

use bytes::Bytes;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use tunmux_proto::{tags, Address, ConnectionId, Frame, FrameDecoder, FrameEvent, FrameSink};

use crate::error::TunnelError;
use crate::handler::ConnectionHandler;
use crate::link::{LinkEvent, LinkNotice, LinkState, NoticeSender, PhysicalLink};
use crate::reassembly::DatagramBuffer;
use crate::table::{ConnectionIdAllocator, ConnectionTable};
use crate::transport::PhysicalConnector;

enum LocalCommand {
    Create {
        id: ConnectionId,
        serial: u64,
        target: Option<Address>,
        header: String,
        handler: Box<dyn ConnectionHandler>,
    },
    Send {
        id: ConnectionId,
        serial: u64,
        address: Option<Address>,
        data: Bytes,
    },
    Close {
        id: ConnectionId,
        serial: u64,
    },
    Disconnect,
    Shutdown,
    ActiveConnections(oneshot::Sender<usize>),
    LinkState(oneshot::Sender<LinkState>),
}

/// Handle to a local endpoint
///
/// Cloning the handle shares the endpoint. The endpoint stops when every
/// handle and every [`LogicalConnection`] is dropped, or on
/// [`shutdown`](Self::shutdown).
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    commands: mpsc::UnboundedSender<LocalCommand>,
    ids: Arc<ConnectionIdAllocator>,
    serials: Arc<AtomicU64>,
}

impl LocalEndpoint {
    /// Start an endpoint on the current tokio runtime
    ///
    /// No physical connection is opened until the first logical connection is
    /// created.
    pub fn new(connector: Arc<dyn PhysicalConnector>) -> Self {
        Self::with_allocator(connector, ConnectionIdAllocator::new())
    }

    pub fn with_allocator(connector: Arc<dyn PhysicalConnector>, ids: ConnectionIdAllocator) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();

        let mux = LocalMultiplexer {
            connector,
            physical: Physical::Unconnected,
            table: ConnectionTable::new(),
            decoder: FrameDecoder::new(),
            generation: 0,
            notices: notices_tx,
        };
        tokio::spawn(mux.run(commands_rx, notices_rx));

        Self {
            commands: commands_tx,
            ids: Arc::new(ids),
            serials: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open a logical connection
    ///
    /// Returns immediately; `handler` learns the outcome. `target` is sent to
    /// the remote side, which resolves it; `header` selects the remote
    /// connector.
    pub fn create<H>(&self, target: Option<Address>, header: impl Into<String>, handler: H) -> LogicalConnection
    where
        H: ConnectionHandler + 'static,
    {
        let id = self.ids.allocate();
        let serial = self.serials.fetch_add(1, Ordering::Relaxed);
        self.post(LocalCommand::Create {
            id,
            serial,
            target,
            header: header.into(),
            handler: Box::new(handler),
        });

        LogicalConnection {
            id,
            serial,
            commands: self.commands.clone(),
        }
    }

    /// Open a TCP connection to `target` on the remote side
    pub fn tcp<H: ConnectionHandler + 'static>(&self, target: Address, handler: H) -> LogicalConnection {
        self.create(Some(target), tags::TCP, handler)
    }

    /// Open a UDP socket on the remote side, optionally connected to `target`
    pub fn udp<H: ConnectionHandler + 'static>(&self, target: Option<Address>, handler: H) -> LogicalConnection {
        self.create(target, tags::UDP, handler)
    }

    /// Open a TLS connection to `target` on the remote side
    pub fn tls<H: ConnectionHandler + 'static>(&self, target: Address, handler: H) -> LogicalConnection {
        self.create(Some(target), tags::TLS, handler)
    }

    /// Open a WebSocket to `target` at route `path` on the remote side
    pub fn websocket<H: ConnectionHandler + 'static>(
        &self,
        target: Address,
        path: &str,
        handler: H,
    ) -> LogicalConnection {
        self.create(Some(target), tags::websocket(path), handler)
    }

    /// Drop the physical connection; open logical connections fail
    ///
    /// The next [`create`](Self::create) opens a fresh physical connection.
    pub fn disconnect(&self) {
        self.post(LocalCommand::Disconnect);
    }

    /// Stop the endpoint; open logical connections fail with `EndpointClosed`
    pub fn shutdown(&self) {
        self.post(LocalCommand::Shutdown);
    }

    /// Number of open logical connections
    pub async fn active_connections(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        self.post(LocalCommand::ActiveConnections(tx));
        rx.await.unwrap_or(0)
    }

    /// State of the physical connection
    pub async fn link_state(&self) -> LinkState {
        let (tx, rx) = oneshot::channel();
        self.post(LocalCommand::LinkState(tx));
        rx.await.unwrap_or(LinkState::Unconnected)
    }

    fn post(&self, command: LocalCommand) {
        if self.commands.send(command).is_err() {
            trace!("Local endpoint stopped, command dropped");
        }
    }
}

/// Handle to one logical connection
///
/// Dropping the handle does not close the connection; call
/// [`close`](Self::close).
#[derive(Debug, Clone)]
pub struct LogicalConnection {
    id: ConnectionId,
    serial: u64,
    commands: mpsc::UnboundedSender<LocalCommand>,
}

impl LogicalConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, data: impl Into<Bytes>) {
        self.post(LocalCommand::Send {
            id: self.id,
            serial: self.serial,
            address: None,
            data: data.into(),
        });
    }

    /// Send a datagram to `address` (UDP connections)
    pub fn send_to(&self, address: Address, data: impl Into<Bytes>) {
        self.post(LocalCommand::Send {
            id: self.id,
            serial: self.serial,
            address: Some(address),
            data: data.into(),
        });
    }

    pub fn close(&self) {
        self.post(LocalCommand::Close {
            id: self.id,
            serial: self.serial,
        });
    }

    fn post(&self, command: LocalCommand) {
        if self.commands.send(command).is_err() {
            trace!("Local endpoint stopped, command for {} dropped", self.id);
        }
    }
}

impl std::fmt::Debug for LocalCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalCommand::Create { id, header, .. } => {
                write!(f, "Create({}, {})", id, header)
            }
            LocalCommand::Send { id, data, .. } => write!(f, "Send({}, {} bytes)", id, data.len()),
            LocalCommand::Close { id, .. } => write!(f, "Close({})", id),
            LocalCommand::Disconnect => write!(f, "Disconnect"),
            LocalCommand::Shutdown => write!(f, "Shutdown"),
            LocalCommand::ActiveConnections(_) => write!(f, "ActiveConnections"),
            LocalCommand::LinkState(_) => write!(f, "LinkState"),
        }
    }
}

struct LocalEntry {
    /// Tells this entry apart from a rejected handle sharing its id
    serial: u64,
    handler: Box<dyn ConnectionHandler>,
    announced: bool,
    /// Deliver every payload whole instead of slice by slice
    datagram: bool,
    reassembly: DatagramBuffer,
}

enum Physical {
    Unconnected,
    Connecting {
        pending: Vec<Bytes>,
        task: JoinHandle<()>,
    },
    Connected(PhysicalLink),
    Failed,
}

impl Physical {
    fn state(&self) -> LinkState {
        match self {
            Physical::Unconnected => LinkState::Unconnected,
            Physical::Connecting { .. } => LinkState::Connecting,
            Physical::Connected(_) => LinkState::Connected,
            Physical::Failed => LinkState::Failed,
        }
    }
}

/// State owned by the endpoint task
struct LocalMultiplexer {
    connector: Arc<dyn PhysicalConnector>,
    physical: Physical,
    table: ConnectionTable<LocalEntry>,
    decoder: FrameDecoder,
    generation: u64,
    notices: NoticeSender,
}

impl LocalMultiplexer {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LocalCommand>,
        mut notices: mpsc::UnboundedReceiver<LinkNotice>,
    ) {
        debug!("Local endpoint started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(LocalCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(notice) = notices.recv() => self.on_notice(notice),
            }
        }

        self.shutdown();
        debug!("Local endpoint stopped");
    }

    fn on_command(&mut self, command: LocalCommand) {
        trace!("Command: {:?}", command);

        match command {
            LocalCommand::Create {
                id,
                serial,
                target,
                header,
                handler,
            } => self.create(id, serial, target, header, handler),
            LocalCommand::Send {
                id,
                serial,
                address,
                data,
            } => self.send(id, serial, address, data),
            LocalCommand::Close { id, serial } => self.close(id, serial),
            LocalCommand::Disconnect => {
                self.teardown(
                    TunnelError::TunnelLost("Disconnected".to_string()),
                    Physical::Unconnected,
                );
            }
            LocalCommand::ActiveConnections(reply) => {
                let _ = reply.send(self.table.len());
            }
            LocalCommand::LinkState(reply) => {
                let _ = reply.send(self.physical.state());
            }
            LocalCommand::Shutdown => {}
        }
    }

    fn create(
        &mut self,
        id: ConnectionId,
        serial: u64,
        target: Option<Address>,
        header: String,
        mut handler: Box<dyn ConnectionHandler>,
    ) {
        if self.table.contains(id) {
            warn!("Connection id {} is still open, refusing to reuse it", id);
            handler.failed(TunnelError::IdInUse(id));
            return;
        }

        self.ensure_physical();

        debug!(
            "Opening logical connection {} ({}{})",
            id,
            header,
            target
                .as_ref()
                .map(|t| format!(" to {}", t))
                .unwrap_or_default()
        );

        let datagram = header.starts_with(tags::UDP);
        if let Err(e) = self.emit(Frame::connect(id, target, header)) {
            handler.failed(e.into());
            return;
        }

        self.table.insert(
            id,
            LocalEntry {
                serial,
                handler,
                announced: false,
                datagram,
                reassembly: DatagramBuffer::default(),
            },
        );

        if matches!(self.physical, Physical::Connected(_)) {
            self.announce_pending();
        }
    }

    /// Whether `id` is open and owned by the handle with `serial`
    fn is_current(&mut self, id: ConnectionId, serial: u64) -> bool {
        self.table
            .get_mut(id)
            .is_some_and(|entry| entry.serial == serial)
    }

    fn send(&mut self, id: ConnectionId, serial: u64, address: Option<Address>, data: Bytes) {
        if !self.is_current(id, serial) {
            debug!("Dropping {} bytes for closed connection {}", data.len(), id);
            return;
        }

        if let Err(e) = self.emit(Frame::send(id, address, data)) {
            error!("Cannot encode data for connection {}: {}", id, e);
            if let Some(mut entry) = self.table.remove(id) {
                entry.handler.failed(e.into());
            }
            let _ = self.emit(Frame::close(id));
        }
    }

    fn close(&mut self, id: ConnectionId, serial: u64) {
        if !self.is_current(id, serial) {
            trace!("Close for connection {} which is already gone", id);
            return;
        }
        self.table.remove(id);

        debug!("Closing logical connection {}", id);
        let _ = self.emit(Frame::close(id));
    }

    /// Open the physical connection unless it is open or opening
    fn ensure_physical(&mut self) {
        if matches!(self.physical, Physical::Connecting { .. } | Physical::Connected(_)) {
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        debug!("Opening physical connection (generation {})", generation);

        let connector = self.connector.clone();
        let notices = self.notices.clone();
        let task = tokio::spawn(async move {
            let event = match connector.connect().await {
                Ok(stream) => LinkEvent::Established(stream),
                Err(e) => LinkEvent::ConnectFailed(e.to_string()),
            };
            let _ = notices.send(LinkNotice { generation, event });
        });

        self.physical = Physical::Connecting {
            pending: Vec::new(),
            task,
        };
    }

    /// Encode a frame and hand it to the physical connection
    ///
    /// Frames emitted while connecting are queued; without a physical
    /// connection they are dropped.
    fn emit(&mut self, frame: Frame) -> Result<(), tunmux_proto::ProtocolError> {
        let encoded = frame.encode()?;
        trace!("Emitting {:?} for {} ({} bytes)", frame.command(), frame.id(), encoded.len());

        match &mut self.physical {
            Physical::Connected(link) => link.write(encoded),
            Physical::Connecting { pending, .. } => pending.push(encoded),
            Physical::Unconnected | Physical::Failed => {
                trace!("No physical connection, frame for {} dropped", frame.id());
            }
        }
        Ok(())
    }

    fn announce_pending(&mut self) {
        for (_, entry) in self.table.iter_mut() {
            if !entry.announced {
                entry.announced = true;
                entry.handler.connected();
            }
        }
    }

    fn on_notice(&mut self, notice: LinkNotice) {
        if notice.generation != self.generation {
            trace!("Ignoring notice from superseded link {}", notice.generation);
            return;
        }

        match notice.event {
            LinkEvent::Established(stream) => {
                if !matches!(self.physical, Physical::Connecting { .. }) {
                    trace!("Physical connection no longer wanted");
                    return;
                }
                let Physical::Connecting { pending, .. } =
                    mem::replace(&mut self.physical, Physical::Unconnected)
                else {
                    return;
                };

                debug!(
                    "Physical connection established, flushing {} frames",
                    pending.len()
                );
                let link = PhysicalLink::start(stream, notice.generation, self.notices.clone());
                for frame in pending {
                    link.write(frame);
                }
                self.physical = Physical::Connected(link);
                self.decoder = FrameDecoder::new();
                self.announce_pending();
            }
            LinkEvent::ConnectFailed(reason) => {
                if matches!(self.physical, Physical::Connecting { .. }) {
                    warn!("Failed to open physical connection: {}", reason);
                    self.teardown(TunnelError::TunnelLost(reason), Physical::Failed);
                }
            }
            LinkEvent::Inbound(chunk) => {
                if !matches!(self.physical, Physical::Connected(_)) {
                    return;
                }

                let mut router = LocalRouter {
                    table: &mut self.table,
                };
                if let Err(e) = self.decoder.decode(chunk, &mut router) {
                    error!("Protocol error on physical connection: {}", e);
                    self.teardown(TunnelError::Protocol(e), Physical::Failed);
                }
            }
            LinkEvent::Lost(reason) => {
                if matches!(self.physical, Physical::Connected(_)) {
                    let reason = reason.unwrap_or_else(|| "Closed by peer".to_string());
                    warn!("Physical connection lost: {}", reason);
                    self.teardown(TunnelError::TunnelLost(reason), Physical::Failed);
                }
            }
        }
    }

    /// Drop the physical connection and fail every open logical connection
    fn teardown(&mut self, error: TunnelError, next: Physical) {
        match mem::replace(&mut self.physical, next) {
            Physical::Connected(link) => link.abort(),
            Physical::Connecting { task, .. } => task.abort(),
            Physical::Unconnected | Physical::Failed => {}
        }
        self.decoder = FrameDecoder::new();
        self.fail_all(error);
    }

    fn fail_all(&mut self, error: TunnelError) {
        let entries = self.table.drain();
        if !entries.is_empty() {
            debug!("Failing {} logical connections: {}", entries.len(), error);
        }
        for (_, mut entry) in entries {
            entry.handler.failed(error.clone());
        }
    }

    fn shutdown(&mut self) {
        match mem::replace(&mut self.physical, Physical::Unconnected) {
            Physical::Connected(link) => link.close(),
            Physical::Connecting { task, .. } => task.abort(),
            Physical::Unconnected | Physical::Failed => {}
        }
        self.fail_all(TunnelError::EndpointClosed);
    }
}

/// Routes decoded frames to local handlers
struct LocalRouter<'a> {
    table: &'a mut ConnectionTable<LocalEntry>,
}

impl FrameSink for LocalRouter<'_> {
    fn on_frame_event(&mut self, event: FrameEvent) {
        match event {
            FrameEvent::Data {
                id,
                address,
                payload,
                remaining,
            } => match self.table.get_mut(id) {
                Some(entry) if entry.datagram || address.is_some() => {
                    if let Some(datagram) = entry.reassembly.push(payload, remaining) {
                        entry.handler.received(address, datagram);
                    }
                }
                Some(entry) => entry.handler.received(address, payload),
                None => debug!("Dropping {} bytes for unknown connection {}", payload.len(), id),
            },
            FrameEvent::Close { id } => match self.table.remove(id) {
                Some(mut entry) => {
                    debug!("Logical connection {} closed by remote", id);
                    entry.handler.closed();
                }
                None => debug!("Dropping close for unknown connection {}", id),
            },
            FrameEvent::Connect { id, header, .. } => {
                warn!("Ignoring CONNECT {} ({}) received by the originating side", id, header);
            }
        }
    }
}
