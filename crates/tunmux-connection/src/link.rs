//! Physical link tasks
//!
//! A physical stream is split in two tasks: the reader forwards every chunk it
//! receives to the owning endpoint, the writer writes encoded frames in the
//! order the endpoint queued them. Notices carry the generation of the link so
//! the endpoint can ignore a link it already replaced.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::transport::BoxedStream;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// State of an endpoint's physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unconnected,
    Connecting,
    Connected,
    Failed,
}

pub(crate) enum LinkEvent {
    /// Lazy connect finished
    Established(BoxedStream),
    /// Lazy connect failed
    ConnectFailed(String),
    /// Bytes from the peer, arbitrarily chunked
    Inbound(Bytes),
    /// The link ended; `None` is an orderly close by the peer
    Lost(Option<String>),
}

pub(crate) struct LinkNotice {
    pub generation: u64,
    pub event: LinkEvent,
}

pub(crate) type NoticeSender = mpsc::UnboundedSender<LinkNotice>;

pub(crate) struct PhysicalLink {
    frames: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PhysicalLink {
    pub fn start(stream: BoxedStream, generation: u64, notices: NoticeSender) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(reader_task(read_half, generation, notices.clone()));
        let writer = tokio::spawn(writer_task(write_half, frames_rx, generation, notices));

        Self {
            frames: frames_tx,
            reader,
            writer,
        }
    }

    /// Queue an encoded frame
    pub fn write(&self, frame: Bytes) {
        if self.frames.send(frame).is_err() {
            trace!("Writer task gone, frame dropped");
        }
    }

    /// Flush queued frames, then shut the stream down
    pub fn close(self) {
        // the writer drains and exits once `frames` is dropped
    }

    /// Drop the stream without flushing
    pub fn abort(self) {
        self.writer.abort();
    }
}

impl Drop for PhysicalLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn reader_task<R>(mut read_half: R, generation: u64, notices: NoticeSender)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        buf.reserve(READ_BUFFER_SIZE);
        let event = match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("Physical connection closed by peer");
                LinkEvent::Lost(None)
            }
            Ok(n) => {
                trace!("Read {} bytes from physical connection", n);
                LinkEvent::Inbound(buf.split().freeze())
            }
            Err(e) => {
                debug!("Physical connection read error: {}", e);
                LinkEvent::Lost(Some(e.to_string()))
            }
        };

        let last = matches!(event, LinkEvent::Lost(_));
        if notices.send(LinkNotice { generation, event }).is_err() || last {
            break;
        }
    }
}

async fn writer_task<W>(
    mut write_half: W,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    generation: u64,
    notices: NoticeSender,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            debug!("Physical connection write error: {}", e);
            let _ = notices.send(LinkNotice {
                generation,
                event: LinkEvent::Lost(Some(e.to_string())),
            });
            return;
        }
    }

    let _ = write_half.shutdown().await;
}
