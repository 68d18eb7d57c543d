//! Header tags sent with CONNECT frames
//!
//! The tag tells the remote side which kind of connector to instantiate for a
//! logical connection. Tags are matched by prefix, so a tag may carry a suffix
//! (the WebSocket tag is followed by the route path, e.g. `ws/chat`).

/// Plain TCP stream to the CONNECT address
pub const TCP: &str = "tcp";

/// UDP socket, optionally connected to the CONNECT address
pub const UDP: &str = "udp";

/// TLS over TCP to the CONNECT address
pub const TLS: &str = "tls";

/// WebSocket client; the route path follows the prefix
pub const WEBSOCKET: &str = "ws";

/// Build the WebSocket header tag for a route path
pub fn websocket(path: &str) -> String {
    if path.starts_with('/') {
        format!("{}{}", WEBSOCKET, path)
    } else {
        format!("{}/{}", WEBSOCKET, path)
    }
}

/// Extract the route path from a WebSocket header tag
pub fn websocket_path(header: &str) -> Option<&str> {
    let path = header.strip_prefix(WEBSOCKET)?;
    if path.is_empty() {
        Some("/")
    } else {
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_tag() {
        assert_eq!(websocket("/chat"), "ws/chat");
        assert_eq!(websocket("chat"), "ws/chat");
        assert_eq!(websocket_path("ws/chat"), Some("/chat"));
        assert_eq!(websocket_path("ws"), Some("/"));
        assert_eq!(websocket_path("tcp"), None);
    }
}
