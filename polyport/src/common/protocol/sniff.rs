// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Non-destructive protocol detection
//!
//! Bytes read while deciding what a client speaks are kept and replayed in front of the stream,
//! so whichever handler takes the session over sees the conversation from its first byte.

use std::{
  pin::Pin,
  task::{Context, Poll},
};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use super::ProtocolKind;

/// Upper bound on the bytes buffered while classifying a session
pub const SNIFF_LIMIT: usize = 1024;

const SOCKS5_VERSION: u8 = 0x05;

const HTTP_METHODS: &[&[u8]] = &[
  b"CONNECT", b"GET", b"POST", b"PUT", b"HEAD", b"DELETE", b"OPTIONS", b"PATCH", b"TRACE",
];

pin_project! {
  /// Replays a captured prefix before continuing to read from the wrapped stream
  ///
  /// Writes pass straight through.
  #[derive(Debug)]
  pub struct ReplayStream<S> {
    prefix: Vec<u8>,
    position: usize,
    #[pin]
    inner: S,
  }
}

impl<S> ReplayStream<S> {
  pub fn new(prefix: Vec<u8>, inner: S) -> Self {
    Self {
      prefix,
      position: 0,
      inner,
    }
  }

  /// Bytes captured but not yet replayed
  pub fn pending(&self) -> &[u8] {
    &self.prefix[self.position..]
  }

  /// Returns the remaining captured bytes along with the underlying stream
  pub fn into_parts(self) -> (Vec<u8>, S) {
    let mut prefix = self.prefix;
    prefix.drain(..self.position);
    (prefix, self.inner)
  }
}

impl<S: AsyncRead> AsyncRead for ReplayStream<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.project();
    if *this.position < this.prefix.len() {
      let remaining = &this.prefix[*this.position..];
      let count = remaining.len().min(buf.remaining());
      buf.put_slice(&remaining[..count]);
      *this.position += count;
      if *this.position == this.prefix.len() {
        this.prefix.clear();
        this.prefix.shrink_to_fit();
        *this.position = 0;
      }
      return Poll::Ready(Ok(()));
    }
    this.inner.poll_read(cx, buf)
  }
}

impl<S: AsyncWrite> AsyncWrite for ReplayStream<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    self.project().inner.poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_shutdown(cx)
  }
}

/// Reads from `stream` until its protocol can be decided, [SNIFF_LIMIT] bytes were seen,
/// the peer stops sending, or `deadline` passes.
///
/// A silent or closed peer is classified as [ProtocolKind::Tunnel]. Only read errors fail.
#[tracing::instrument(level = "trace", skip(stream), err)]
pub async fn sniff<S>(
  mut stream: S,
  deadline: tokio::time::Instant,
) -> std::io::Result<(ProtocolKind, ReplayStream<S>)>
where
  S: AsyncRead + Unpin,
{
  let mut captured = Vec::with_capacity(SNIFF_LIMIT);
  let mut chunk = [0u8; SNIFF_LIMIT];
  let kind = loop {
    if let Some(kind) = classify_partial(&captured) {
      break kind;
    }
    if captured.len() >= SNIFF_LIMIT {
      break classify(&captured);
    }
    let room = SNIFF_LIMIT - captured.len();
    match tokio::time::timeout_at(deadline, stream.read(&mut chunk[..room])).await {
      Ok(Ok(0)) => {
        tracing::trace!(captured = captured.len(), "Peer stopped sending while sniffing");
        break classify(&captured);
      }
      Ok(Ok(read)) => captured.extend_from_slice(&chunk[..read]),
      Ok(Err(e)) => return Err(e),
      Err(_elapsed) => {
        tracing::trace!(captured = captured.len(), "Sniff deadline passed");
        break classify(&captured);
      }
    }
  };
  Ok((kind, ReplayStream::new(captured, stream)))
}

/// Final classification of everything a peer sent before sniffing stopped
pub fn classify(captured: &[u8]) -> ProtocolKind {
  if captured.is_empty() {
    return ProtocolKind::Tunnel;
  }
  if let Some(kind) = classify_partial(captured) {
    return kind;
  }
  // An incomplete head; only its request line can be judged
  match request_method(captured) {
    Some(method) if method == b"CONNECT" => ProtocolKind::Tunnel,
    _ if contains_websocket_upgrade(captured) => ProtocolKind::Tunnel,
    _ => ProtocolKind::Unrecognized,
  }
}

/// `None` while more bytes could still change the outcome
fn classify_partial(captured: &[u8]) -> Option<ProtocolKind> {
  let first = *captured.first()?;
  if first == SOCKS5_VERSION {
    return Some(ProtocolKind::Socks5);
  }
  if !could_be_http(captured) {
    return Some(ProtocolKind::Unrecognized);
  }
  let head_end = find_subsequence(captured, b"\r\n\r\n")?;
  let head = &captured[..head_end];
  if request_method(head) == Some(b"CONNECT".as_slice()) || contains_websocket_upgrade(head) {
    Some(ProtocolKind::Tunnel)
  } else {
    Some(ProtocolKind::Unrecognized)
  }
}

fn could_be_http(captured: &[u8]) -> bool {
  match captured.iter().position(|b| *b == b' ') {
    Some(end) => HTTP_METHODS.iter().any(|method| *method == &captured[..end]),
    None => HTTP_METHODS
      .iter()
      .any(|method| method.len() >= captured.len() && method.starts_with(captured)),
  }
}

fn request_method(captured: &[u8]) -> Option<&[u8]> {
  let end = captured.iter().position(|b| *b == b' ')?;
  Some(&captured[..end])
}

/// Looks for an `Upgrade` header whose value names `websocket`, ignoring case
fn contains_websocket_upgrade(head: &[u8]) -> bool {
  String::from_utf8_lossy(head)
    .split("\r\n")
    .skip(1)
    .filter_map(|line| line.split_once(':'))
    .any(|(name, value)| {
      name.trim().eq_ignore_ascii_case("upgrade")
        && value.to_ascii_lowercase().contains("websocket")
    })
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  haystack
    .windows(needle.len())
    .position(|window| window == needle)
}
