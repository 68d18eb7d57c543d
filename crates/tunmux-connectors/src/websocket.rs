//! WebSocket connector

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace};
use tunmux_connection::{ConnectionHandler, Connector, ConnectorFactory, TunnelError};
use tunmux_proto::{tags, Address};
use url::Url;

use crate::task::{connect_or_close, CommandReceiver, ConnectorCommand, Queued, TaskConnector};
use crate::tcp::require_address;

/// Opens a WebSocket to `ws://<address><path>`
///
/// The path is the part of the header tag after the `ws` prefix. Payloads
/// travel as binary messages; text messages from the server are passed on as
/// their UTF-8 bytes.
#[derive(Debug, Clone)]
pub struct WebSocketConnectorFactory {
    connect_timeout: Duration,
}

impl WebSocketConnectorFactory {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for WebSocketConnectorFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// URL of the WebSocket route behind a header tag
pub fn websocket_url(address: &Address, header: &str) -> Result<Url, TunnelError> {
    let path = tags::websocket_path(header).unwrap_or("/");
    let raw = format!("ws://{}{}", address, path);
    Url::parse(&raw).map_err(|e| TunnelError::ConnectFailed(format!("Invalid URL {}: {}", raw, e)))
}

impl ConnectorFactory for WebSocketConnectorFactory {
    fn create(
        &self,
        address: Option<Address>,
        header: &str,
        handler: Box<dyn ConnectionHandler>,
    ) -> Box<dyn Connector> {
        let (address, mut handler) = match require_address(address, "WebSocket", handler) {
            Ok(found) => found,
            Err(failed) => return failed,
        };
        let url = websocket_url(&address, header);
        let connect_timeout = self.connect_timeout;

        TaskConnector::spawn(move |mut commands| async move {
            let url = match url {
                Ok(url) => url,
                Err(e) => {
                    handler.failed(e);
                    return;
                }
            };

            debug!("Connecting to WebSocket: {}", url);
            let mut queued = Vec::new();
            let connect = timeout(connect_timeout, connect_async(url.as_str()));
            match connect_or_close(connect, &mut commands, &mut queued).await {
                Some(Ok(Ok((ws_stream, _response)))) => {
                    debug!("WebSocket connected");
                    pump_messages(ws_stream, queued, commands, handler).await;
                }
                Some(Ok(Err(e))) => {
                    handler.failed(TunnelError::ConnectFailed(format!("{}: {}", url, e)))
                }
                Some(Err(_)) => handler.failed(TunnelError::ConnectFailed(format!(
                    "Timed out connecting to {}",
                    url
                ))),
                None => {}
            }
        })
    }
}

async fn pump_messages<S>(
    ws_stream: S,
    queued: Queued,
    mut commands: CommandReceiver,
    mut handler: Box<dyn ConnectionHandler>,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    handler.connected();

    let (mut sink, mut stream) = ws_stream.split();
    for (_, data) in queued {
        if let Err(e) = sink.send(Message::Binary(data.to_vec())).await {
            handler.failed(TunnelError::Io(e.to_string()));
            return;
        }
    }

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    trace!("Received {} bytes via WebSocket", data.len());
                    handler.received(None, Bytes::from(data));
                }
                Some(Ok(Message::Text(text))) => {
                    handler.received(None, Bytes::from(text));
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket closed by remote");
                    handler.closed();
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    handler.failed(TunnelError::Io(e.to_string()));
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(ConnectorCommand::Send(_, data)) => {
                    if let Err(e) = sink.send(Message::Binary(data.to_vec())).await {
                        handler.failed(TunnelError::Io(e.to_string()));
                        break;
                    }
                }
                Some(ConnectorCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_from_header() {
        let address = Address::new("chat.internal", 8080);
        assert_eq!(
            websocket_url(&address, "ws/rooms/1").unwrap().as_str(),
            "ws://chat.internal:8080/rooms/1"
        );
        assert_eq!(
            websocket_url(&address, "ws").unwrap().as_str(),
            "ws://chat.internal:8080/"
        );
    }

    #[test]
    fn test_websocket_url_ipv6() {
        let address = Address::new("::1", 9000);
        assert_eq!(
            websocket_url(&address, "ws/x").unwrap().as_str(),
            "ws://[::1]:9000/x"
        );
    }
}
