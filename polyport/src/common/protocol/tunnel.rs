// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! HTTP `CONNECT` and WebSocket-upgrade tunnels
//!
//! Sessions that fit neither shape are relayed verbatim to the fallback target.

use std::{net::SocketAddr, time::Duration};

use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{
  address::TargetAddress,
  dial,
  sniff::{find_subsequence, ReplayStream, SNIFF_LIMIT},
  ProtocolKind, SessionError,
};
use crate::util::{relay, session_stream::SessionStream, RelayStats};

/// Largest request head accepted before giving up on parsing it
pub const MAX_HEAD_LENGTH: usize = 8 * 1024;

pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Local SSH; where tunnels without a usable destination are sent
pub const DEFAULT_FALLBACK_TARGET: SocketAddr =
  SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 22);

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_BAD_REQUEST: &[u8] =
  b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const RESPONSE_BAD_GATEWAY: &[u8] =
  b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Debug, Clone)]
pub struct TunnelHandler {
  fallback_target: TargetAddress,
  dial_timeout: Duration,
  head_timeout: Duration,
}

impl Default for TunnelHandler {
  fn default() -> Self {
    Self::new(
      DEFAULT_FALLBACK_TARGET.into(),
      super::socks5::DEFAULT_DIAL_TIMEOUT,
      DEFAULT_HEAD_TIMEOUT,
    )
  }
}

/// What a complete request head asks for
#[derive(Debug, PartialEq, Eq)]
enum TunnelRequest {
  Connect(Option<TargetAddress>),
  WebSocket { key: Option<String> },
  Other,
}

impl TunnelHandler {
  pub fn new(fallback_target: TargetAddress, dial_timeout: Duration, head_timeout: Duration) -> Self {
    Self {
      fallback_target,
      dial_timeout,
      head_timeout,
    }
  }

  pub fn fallback_target(&self) -> &TargetAddress {
    &self.fallback_target
  }

  /// Serves a session classified as [ProtocolKind::Tunnel] or [ProtocolKind::Unrecognized]
  ///
  /// `stream` is the sniffer's output: its pending bytes are everything the client sent while
  /// being classified. A client that sent nothing goes to the fallback target at once.
  pub async fn handle<S>(
    &self,
    stream: ReplayStream<S>,
    kind: ProtocolKind,
  ) -> Result<RelayStats, SessionError>
  where
    S: SessionStream,
  {
    if kind != ProtocolKind::Tunnel {
      return self.relay_to_fallback(stream).await;
    }
    if stream.pending().is_empty() {
      tracing::debug!("Client sent nothing; relaying to fallback");
      return self.relay_to_fallback(stream).await;
    }
    let (captured, mut stream) = stream.into_parts();
    let (captured, head_length) = match self.complete_head(captured, &mut stream).await? {
      HeadRead::Complete { captured, length } => (captured, length),
      HeadRead::Incomplete(captured) => {
        if let Some(target) = connect_line_target(&captured) {
          tracing::debug!(%target, "CONNECT request line without a terminated head");
          return self.establish_connect(stream, target, Vec::new()).await;
        }
        tracing::debug!(
          captured = captured.len(),
          "No complete request head; relaying to fallback"
        );
        return self
          .relay_to_fallback(ReplayStream::new(captured, stream))
          .await;
      }
    };
    match parse_request(&captured[..head_length]) {
      TunnelRequest::Connect(target) => {
        let target = target.unwrap_or_else(|| {
          tracing::debug!(fallback = %self.fallback_target, "CONNECT without usable target");
          self.fallback_target.clone()
        });
        let leftover = captured[head_length..].to_vec();
        self.establish_connect(stream, target, leftover).await
      }
      TunnelRequest::WebSocket { key: None } => {
        stream.write_all(RESPONSE_BAD_REQUEST).await?;
        stream.flush().await?;
        Err(SessionError::Handshake(
          "WebSocket upgrade without Sec-WebSocket-Key".into(),
        ))
      }
      TunnelRequest::WebSocket { key: Some(key) } => {
        let target = self.fallback_target.clone();
        let outbound = self.dial_or_reject(&mut stream, &target).await?;
        let response = format!(
          "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
          websocket_accept(&key)
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;
        let leftover = captured[head_length..].to_vec();
        let stats = relay(ReplayStream::new(leftover, stream), outbound).await?;
        tracing::debug!(%target, sent = stats.a_to_b, received = stats.b_to_a, "WebSocket tunnel closed");
        Ok(stats)
      }
      TunnelRequest::Other => {
        self
          .relay_to_fallback(ReplayStream::new(captured, stream))
          .await
      }
    }
  }

  async fn establish_connect<S: SessionStream>(
    &self,
    mut stream: S,
    target: TargetAddress,
    leftover: Vec<u8>,
  ) -> Result<RelayStats, SessionError> {
    let outbound = self.dial_or_reject(&mut stream, &target).await?;
    stream.write_all(RESPONSE_ESTABLISHED).await?;
    stream.flush().await?;
    let stats = relay(ReplayStream::new(leftover, stream), outbound).await?;
    tracing::debug!(%target, sent = stats.a_to_b, received = stats.b_to_a, "CONNECT tunnel closed");
    Ok(stats)
  }

  /// Best-effort relay of a session to the fallback target; nothing is written to the client first
  async fn relay_to_fallback<S: SessionStream>(&self, stream: S) -> Result<RelayStats, SessionError> {
    let outbound = match dial(&self.fallback_target, self.dial_timeout).await {
      Ok(outbound) => outbound,
      Err(e) => {
        tracing::info!(target = %self.fallback_target, error = %e, "Fallback target unreachable");
        return Err(e);
      }
    };
    let stats = relay(stream, outbound).await?;
    tracing::debug!(
      target = %self.fallback_target,
      sent = stats.a_to_b,
      received = stats.b_to_a,
      "Fallback relay closed"
    );
    Ok(stats)
  }

  async fn dial_or_reject<S: SessionStream>(
    &self,
    stream: &mut S,
    target: &TargetAddress,
  ) -> Result<tokio::net::TcpStream, SessionError> {
    match dial(target, self.dial_timeout).await {
      Ok(outbound) => Ok(outbound),
      Err(e) => {
        tracing::info!(%target, error = %e, "Tunnel target unreachable");
        let _ = stream.write_all(RESPONSE_BAD_GATEWAY).await;
        let _ = stream.flush().await;
        Err(e)
      }
    }
  }

  /// Finishes reading a request head the sniffer started
  ///
  /// Sniffing stops short of [SNIFF_LIMIT] only when the client paused or closed, in which case
  /// no more is waited for. A head longer than that is read on up to [MAX_HEAD_LENGTH].
  async fn complete_head<S: SessionStream>(
    &self,
    mut captured: Vec<u8>,
    stream: &mut S,
  ) -> Result<HeadRead, SessionError> {
    let deadline = tokio::time::Instant::now() + self.head_timeout;
    let mut chunk = [0u8; 1024];
    loop {
      if let Some(end) = find_subsequence(&captured, b"\r\n\r\n") {
        return Ok(HeadRead::Complete {
          captured,
          length: end + 4,
        });
      }
      if captured.len() < SNIFF_LIMIT || captured.len() >= MAX_HEAD_LENGTH {
        return Ok(HeadRead::Incomplete(captured));
      }
      let room = (MAX_HEAD_LENGTH - captured.len()).min(chunk.len());
      match tokio::time::timeout_at(deadline, stream.read(&mut chunk[..room])).await {
        Ok(Ok(0)) | Err(_) => return Ok(HeadRead::Incomplete(captured)),
        Ok(Ok(read)) => captured.extend_from_slice(&chunk[..read]),
        Ok(Err(e)) => return Err(e.into()),
      }
    }
  }
}

enum HeadRead {
  Complete { captured: Vec<u8>, length: usize },
  Incomplete(Vec<u8>),
}

/// The destination of a complete `CONNECT` request line, even when no header follows it
fn connect_line_target(captured: &[u8]) -> Option<TargetAddress> {
  let line_end = find_subsequence(captured, b"\r\n")?;
  match parse_request(&captured[..line_end]) {
    TunnelRequest::Connect(target) => target,
    _ => None,
  }
}

fn parse_request(head: &[u8]) -> TunnelRequest {
  let text = String::from_utf8_lossy(head);
  let mut lines = text.split("\r\n");
  let request_line = lines.next().unwrap_or_default();
  let mut tokens = request_line.split_whitespace();
  let method = tokens.next().unwrap_or_default();
  if method.eq_ignore_ascii_case("CONNECT") {
    let target = tokens.next().and_then(|t| t.parse::<TargetAddress>().ok());
    return TunnelRequest::Connect(target);
  }
  let mut upgrade = false;
  let mut key = None;
  for (name, value) in lines.filter_map(|line| line.split_once(':')) {
    let (name, value) = (name.trim(), value.trim());
    if name.eq_ignore_ascii_case("upgrade") && value.to_ascii_lowercase().contains("websocket") {
      upgrade = true;
    } else if name.eq_ignore_ascii_case("sec-websocket-key") && !value.is_empty() {
      key = Some(value.to_string());
    }
  }
  if upgrade {
    TunnelRequest::WebSocket { key }
  } else {
    TunnelRequest::Other
  }
}

/// The `Sec-WebSocket-Accept` token answering a client's `Sec-WebSocket-Key`
pub fn websocket_accept(key: &str) -> String {
  let mut hasher = Sha1::new();
  hasher.update(key.as_bytes());
  hasher.update(WEBSOCKET_GUID.as_bytes());
  base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}
