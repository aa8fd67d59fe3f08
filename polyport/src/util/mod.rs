// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  pin::Pin,
  sync::atomic::{AtomicU64, Ordering},
  task::{ready, Context, Poll},
  time::Duration,
};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

pub mod cancellation;
pub mod log_buffer;
pub mod logs;
pub mod session_stream;
pub mod validators;

const PROXY_BUFFER_CAPACITY: usize = 1024 * 32;

/// How long the surviving direction of a relay may keep flowing after the other side closed
pub const RELAY_LINGER: Duration = Duration::from_secs(5);

/// Byte counts moved by a finished relay, per direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
  pub a_to_b: u64,
  pub b_to_a: u64,
}

/// Copy bytes between two duplex streams until either side closes or fails.
///
/// When one direction reaches EOF, the opposite write half is shut down and the remaining
/// direction is given [RELAY_LINGER] to drain before both are dropped. An error in either
/// direction abandons the other immediately.
pub async fn relay<A, B>(a: A, b: B) -> Result<RelayStats, std::io::Error>
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  relay_with_linger(a, b, RELAY_LINGER).await
}

#[tracing::instrument(level = "trace", err, skip(a, b))]
pub async fn relay_with_linger<A, B>(
  a: A,
  b: B,
  linger: Duration,
) -> Result<RelayStats, std::io::Error>
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  let (mut reader_a, mut sender_a) = tokio::io::split(a);
  let (mut reader_b, mut sender_b) = tokio::io::split(b);
  let a_to_b_count = AtomicU64::new(0);
  let b_to_a_count = AtomicU64::new(0);
  {
    let a_to_b = copy_then_shutdown(&mut reader_a, &mut sender_b, &a_to_b_count);
    let b_to_a = copy_then_shutdown(&mut reader_b, &mut sender_a, &b_to_a_count);
    tokio::pin!(a_to_b);
    tokio::pin!(b_to_a);
    tracing::trace!("polling");
    let result = tokio::select! {
      res = &mut a_to_b => match res {
        Ok(()) => drain_within(linger, &mut b_to_a).await,
        Err(e) => Err(e),
      },
      res = &mut b_to_a => match res {
        Ok(()) => drain_within(linger, &mut a_to_b).await,
        Err(e) => Err(e),
      },
    };
    if let Err(e) = result {
      tracing::debug!(error = ?e, "Relay copy ended with error");
      return Err(e);
    }
  }
  Ok(RelayStats {
    a_to_b: a_to_b_count.into_inner(),
    b_to_a: b_to_a_count.into_inner(),
  })
}

async fn copy_then_shutdown<R, W>(
  reader: &mut R,
  writer: &mut W,
  counter: &AtomicU64,
) -> Result<(), std::io::Error>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut reader = BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader);
  let mut counted = CountingWriter {
    inner: &mut *writer,
    counter,
  };
  tokio::io::copy_buf(&mut reader, &mut counted).await?;
  // The peer may already be gone; a failed half-close is not a relay failure
  if let Err(e) = writer.shutdown().await {
    tracing::trace!(error = ?e, "Half-close after EOF failed");
  }
  Ok(())
}

pin_project! {
  /// Tallies bytes accepted by the wrapped writer, so a direction cut off mid-copy still reports
  /// what it moved
  struct CountingWriter<'a, W> {
    #[pin]
    inner: W,
    counter: &'a AtomicU64,
  }
}

impl<'a, W: AsyncWrite> AsyncWrite for CountingWriter<'a, W> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    let this = self.project();
    let written = ready!(this.inner.poll_write(cx, buf))?;
    this.counter.fetch_add(written as u64, Ordering::Relaxed);
    Poll::Ready(Ok(written))
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_shutdown(cx)
  }
}

async fn drain_within<F>(linger: Duration, remaining: F) -> Result<(), std::io::Error>
where
  F: std::future::Future<Output = Result<(), std::io::Error>>,
{
  match tokio::time::timeout(linger, remaining).await {
    Ok(res) => res,
    Err(_elapsed) => {
      tracing::trace!("Remaining relay direction abandoned after linger period");
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::time::Duration;

  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
  use tokio::sync::Barrier;

  // Given input to one side terminating, ensure that a source stream closing also closes its output
  #[tokio::test]
  async fn independent_directional_closure() {
    let (client, client_peer) = duplex(2048);
    let (target, target_peer) = duplex(2048);

    let request_input = Vec::from(*b"request").repeat(128);
    let response_input = Vec::from(*b"response").repeat(128);

    let all_relaying_ready = Arc::new(Barrier::new(3));

    let client_task = tokio::task::spawn({
      let all_relaying_ready = all_relaying_ready.clone();
      let request_input = request_input.clone();
      async move {
        let (mut r, mut w) = tokio::io::split(client);
        all_relaying_ready.wait().await;
        w.write_all(&request_input).await.unwrap();
        w.shutdown().await.unwrap();
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).await.unwrap();
        buf
      }
    });

    let target_task = tokio::task::spawn({
      let all_relaying_ready = all_relaying_ready.clone();
      let response_input = response_input.clone();
      async move {
        let (mut r, mut w) = tokio::io::split(target);
        all_relaying_ready.wait().await;
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).await.unwrap();
        w.write_all(&response_input).await.unwrap();
        w.shutdown().await.unwrap();
        buf
      }
    });

    let relay_task = tokio::task::spawn({
      let all_relaying_ready = all_relaying_ready.clone();
      async move {
        all_relaying_ready.wait().await;
        super::relay(client_peer, target_peer).await.unwrap()
      }
    });

    let (received_by_client, received_by_target, stats) = tokio::time::timeout(
      Duration::from_secs(10),
      futures::future::try_join3(client_task, target_task, relay_task),
    )
    .await
    .expect("Timeout reached running relay test")
    .expect("Relay test task panicked");

    assert_eq!(received_by_target, request_input);
    assert_eq!(received_by_client, response_input);
    assert_eq!(stats.a_to_b, request_input.len() as u64);
    assert_eq!(stats.b_to_a, response_input.len() as u64);
  }

  #[tokio::test]
  async fn peer_disconnect_terminates_opposite_direction() {
    let (client, client_peer) = duplex(1024);
    // The target never writes nor closes; only the linger bound may end its direction
    let (_target, target_peer) = duplex(1024);

    let relay = tokio::task::spawn(super::relay_with_linger(
      client_peer,
      target_peer,
      Duration::from_millis(200),
    ));
    drop(client);

    let stats = tokio::time::timeout(Duration::from_secs(5), relay)
      .await
      .expect("Relay must terminate after the client disconnects")
      .unwrap()
      .unwrap();
    assert_eq!(stats, super::RelayStats::default());
  }

  #[tokio::test]
  async fn abandoned_direction_still_reports_bytes_moved() {
    let (mut client, client_peer) = duplex(1024);
    let (mut target, target_peer) = duplex(1024);
    target.write_all(b"partial").await.unwrap();

    let relay = tokio::task::spawn(super::relay_with_linger(
      client_peer,
      target_peer,
      Duration::from_millis(200),
    ));
    let mut received = [0u8; 7];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"partial");
    // Half-close only; the target keeps its side open past the linger period
    client.shutdown().await.unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(5), relay)
      .await
      .expect("Relay must end once the linger period passes")
      .unwrap()
      .unwrap();
    assert_eq!(stats.a_to_b, 0);
    assert_eq!(stats.b_to_a, 7);
    drop(target);
  }
}
