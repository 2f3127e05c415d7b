//! CRDT relay (wire) client: `yrs`'s standard sync protocol over
//! `tokio-tungstenite`, plus a minimal awareness channel.
//!
//! The client-side counterpart to an axum/`tungstenite`-backed server WS
//! handler; reconnect back-off shares [`crate::backoff`] with the HTTP
//! fallback adapter's retry policy.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use url::Url;

use crate::backoff::delay_for_attempt;
use crate::error::{Error, Result};

const RECONNECT_CAP: Duration = Duration::from_secs(300);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A connected relay session. `send_update`/`send_state_vector` write sync
/// protocol frames; `recv` yields the next inbound frame.
pub struct RelayClient {
    stream: WsStream,
}

/// One frame of the sync/awareness protocol exchanged with the relay.
#[derive(Debug, Clone)]
pub enum RelayFrame {
    StateVector(Vec<u8>),
    Update(Vec<u8>),
    Awareness(Vec<u8>),
}

impl RelayClient {
    /// Connect to `server_url`, appending `?token=<value>` when a room
    /// token is configured. Retries with exponential back-off capped at
    /// 5 minutes.
    pub async fn connect(server_url: &str, room_token: Option<&str>) -> Result<Self> {
        let url = build_url(server_url, room_token)?;
        let mut errors = 0u32;
        loop {
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((stream, _response)) => {
                    info!(url = %url, "connected to relay");
                    return Ok(Self { stream });
                }
                Err(e) => {
                    errors += 1;
                    let delay = delay_for_attempt(errors, RECONNECT_CAP);
                    warn!(error = %e, errors, delay_ms = delay.as_millis(), "relay connect failed, retrying");
                    if errors >= 20 {
                        return Err(Error::Relay(format!("giving up after {errors} attempts: {e}")));
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub async fn send_state_vector(&mut self, sv: Vec<u8>) -> Result<()> {
        self.send_frame(0u8, sv).await
    }

    pub async fn send_update(&mut self, update: Vec<u8>) -> Result<()> {
        self.send_frame(1u8, update).await
    }

    pub async fn send_awareness(&mut self, payload: Vec<u8>) -> Result<()> {
        self.send_frame(2u8, payload).await
    }

    async fn send_frame(&mut self, tag: u8, mut payload: Vec<u8>) -> Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(tag);
        frame.append(&mut payload);
        self.stream
            .send(Message::Binary(frame))
            .await
            .map_err(|e| Error::Relay(e.to_string()))
    }

    /// Read the next frame, or `None` on a clean close.
    pub async fn recv(&mut self) -> Result<Option<RelayFrame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    let (tag, payload) = (bytes[0], bytes[1..].to_vec());
                    return Ok(Some(match tag {
                        0 => RelayFrame::StateVector(payload),
                        1 => RelayFrame::Update(payload),
                        _ => RelayFrame::Awareness(payload),
                    }));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(Error::Relay(e.to_string())),
            }
        }
    }
}

fn build_url(server_url: &str, room_token: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(server_url).map_err(|e| Error::Config(format!("invalid serverUrl: {e}")))?;
    if let Some(token) = room_token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_appends_token_query_param() {
        let url = build_url("wss://relay.example.com/room", Some("secret")).unwrap();
        assert_eq!(url.query(), Some("token=secret"));
    }

    #[test]
    fn build_url_without_token_has_no_query() {
        let url = build_url("wss://relay.example.com/room", None).unwrap();
        assert_eq!(url.query(), None);
    }

    #[test]
    fn build_url_rejects_malformed_input() {
        assert!(build_url("not a url", None).is_err());
    }
}
