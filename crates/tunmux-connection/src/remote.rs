//! Remote (accepting) multiplexer endpoint

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use tunmux_proto::{Address, ConnectionId, Frame, FrameDecoder, FrameEvent, FrameSink};

use crate::connector::{Connector, ConnectorFactory};
use crate::error::TunnelError;
use crate::handler::ConnectionHandler;
use crate::link::{LinkEvent, LinkNotice, PhysicalLink};
use crate::reassembly::DatagramBuffer;
use crate::table::ConnectionTable;
use crate::transport::PhysicalStream;

/// Accepts logical connections arriving over physical connections
///
/// Each call to [`serve`](Self::serve) drives one physical connection with its
/// own connection table; the factory is shared.
#[derive(Clone)]
pub struct RemoteEndpoint {
    factory: Arc<dyn ConnectorFactory>,
}

impl std::fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEndpoint").finish_non_exhaustive()
    }
}

/// Connector activity, tagged with the entry it belongs to
enum TargetEvent {
    Received {
        id: ConnectionId,
        serial: u64,
        address: Option<Address>,
        data: Bytes,
    },
    Closed {
        id: ConnectionId,
        serial: u64,
    },
    Failed {
        id: ConnectionId,
        serial: u64,
        error: TunnelError,
    },
}

/// Handler given to a connector; forwards into the serving task
struct TargetHandler {
    id: ConnectionId,
    serial: u64,
    events: mpsc::UnboundedSender<TargetEvent>,
}

impl ConnectionHandler for TargetHandler {
    fn connected(&mut self) {
        trace!("Connector for {} connected", self.id);
    }

    fn received(&mut self, address: Option<Address>, data: Bytes) {
        let _ = self.events.send(TargetEvent::Received {
            id: self.id,
            serial: self.serial,
            address,
            data,
        });
    }

    fn closed(&mut self) {
        let _ = self.events.send(TargetEvent::Closed {
            id: self.id,
            serial: self.serial,
        });
    }

    fn failed(&mut self, error: TunnelError) {
        let _ = self.events.send(TargetEvent::Failed {
            id: self.id,
            serial: self.serial,
            error,
        });
    }
}

struct RemoteEntry {
    serial: u64,
    connector: Box<dyn Connector>,
    datagram: DatagramBuffer,
}

impl RemoteEndpoint {
    pub fn new(factory: Arc<dyn ConnectorFactory>) -> Self {
        Self { factory }
    }

    /// Serve one physical connection until it ends
    ///
    /// Returns `Ok` when the peer closes the connection and an error on a
    /// protocol violation or transport failure. Every connector still open
    /// when the physical connection ends is closed.
    pub async fn serve<S: PhysicalStream>(&self, stream: S) -> Result<(), TunnelError> {
        let (notices_tx, mut notices) = mpsc::unbounded_channel();
        let (targets_tx, mut targets) = mpsc::unbounded_channel();

        let link = PhysicalLink::start(Box::new(stream), 0, notices_tx);
        let mut table = ConnectionTable::new();
        let mut decoder = FrameDecoder::new();
        let mut serial = 0u64;

        let result = loop {
            tokio::select! {
                Some(LinkNotice { event, .. }) = notices.recv() => match event {
                    LinkEvent::Inbound(chunk) => {
                        let mut router = RemoteRouter {
                            factory: self.factory.as_ref(),
                            table: &mut table,
                            targets: &targets_tx,
                            serial: &mut serial,
                        };
                        if let Err(e) = decoder.decode(chunk, &mut router) {
                            error!("Protocol error on physical connection: {}", e);
                            break Err(TunnelError::Protocol(e));
                        }
                    }
                    LinkEvent::Lost(None) => {
                        debug!("Physical connection closed by peer");
                        break Ok(());
                    }
                    LinkEvent::Lost(Some(reason)) => {
                        warn!("Physical connection lost: {}", reason);
                        break Err(TunnelError::TunnelLost(reason));
                    }
                    LinkEvent::Established(_) | LinkEvent::ConnectFailed(_) => {}
                },
                Some(event) = targets.recv() => on_target_event(&mut table, &link, event),
                else => break Ok(()),
            }
        };

        let entries = table.drain();
        if !entries.is_empty() {
            debug!("Closing {} connectors", entries.len());
        }
        for (_, mut entry) in entries {
            entry.connector.close();
        }

        match result {
            Ok(()) => link.close(),
            Err(_) => link.abort(),
        }
        result
    }
}

fn on_target_event(
    table: &mut ConnectionTable<RemoteEntry>,
    link: &PhysicalLink,
    event: TargetEvent,
) {
    match event {
        TargetEvent::Received {
            id,
            serial,
            address,
            data,
        } => {
            if !is_current(table, id, serial) {
                trace!("Dropping {} bytes from retired connector {}", data.len(), id);
                return;
            }
            match Frame::send(id, address, data).encode() {
                Ok(frame) => link.write(frame),
                Err(e) => {
                    error!("Cannot encode data from connector {}: {}", id, e);
                    retire(table, link, id);
                }
            }
        }
        TargetEvent::Closed { id, serial } => {
            if is_current(table, id, serial) {
                debug!("Connector {} closed", id);
                retire(table, link, id);
            }
        }
        TargetEvent::Failed { id, serial, error } => {
            if is_current(table, id, serial) {
                warn!("Connector {} failed: {}", id, error);
                retire(table, link, id);
            }
        }
    }
}

fn is_current(table: &mut ConnectionTable<RemoteEntry>, id: ConnectionId, serial: u64) -> bool {
    table.get_mut(id).is_some_and(|entry| entry.serial == serial)
}

/// Forget a connector and tell the originating side
fn retire(table: &mut ConnectionTable<RemoteEntry>, link: &PhysicalLink, id: ConnectionId) {
    if let Some(mut entry) = table.remove(id) {
        entry.connector.close();
    }
    match Frame::close(id).encode() {
        Ok(frame) => link.write(frame),
        Err(e) => error!("Cannot encode close for {}: {}", id, e),
    }
}

/// Routes decoded frames to connectors
struct RemoteRouter<'a> {
    factory: &'a dyn ConnectorFactory,
    table: &'a mut ConnectionTable<RemoteEntry>,
    targets: &'a mpsc::UnboundedSender<TargetEvent>,
    serial: &'a mut u64,
}

impl FrameSink for RemoteRouter<'_> {
    fn on_frame_event(&mut self, event: FrameEvent) {
        match event {
            FrameEvent::Connect {
                id,
                address,
                header,
            } => {
                debug!(
                    "CONNECT {} ({}{})",
                    id,
                    header,
                    address
                        .as_ref()
                        .map(|a| format!(" to {}", a))
                        .unwrap_or_default()
                );

                *self.serial += 1;
                let handler = TargetHandler {
                    id,
                    serial: *self.serial,
                    events: self.targets.clone(),
                };
                let connector = self.factory.create(address, &header, Box::new(handler));

                let entry = RemoteEntry {
                    serial: *self.serial,
                    connector,
                    datagram: DatagramBuffer::default(),
                };
                if let Some(mut old) = self.table.insert(id, entry) {
                    warn!("CONNECT for open connection {}, closing the previous connector", id);
                    old.connector.close();
                }
            }
            FrameEvent::Data {
                id,
                address,
                payload,
                remaining,
            } => match self.table.get_mut(id) {
                Some(entry) if entry.connector.is_datagram() => {
                    if let Some(datagram) = entry.datagram.push(payload, remaining) {
                        entry.connector.send(address, datagram);
                    }
                }
                Some(entry) => entry.connector.send(address, payload),
                None => debug!("Dropping {} bytes for unknown connection {}", payload.len(), id),
            },
            FrameEvent::Close { id } => match self.table.remove(id) {
                Some(mut entry) => {
                    debug!("CLOSE {}", id);
                    entry.connector.close();
                }
                None => debug!("Dropping close for unknown connection {}", id),
            },
        }
    }
}
