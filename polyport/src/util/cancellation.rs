// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A [CancellationToken] that cannot be triggered by its recipient
///
/// Handed to accept loops so they can observe shutdown without being able to request it.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

/// Produces a token cancelled by the first SIGINT or SIGTERM delivered to this process
///
/// The returned task should be aborted once the caller no longer needs signal handling.
pub fn shutdown_on_signals() -> (CancellationToken, tokio::task::JoinHandle<()>) {
  let shutdown = CancellationToken::new();
  let shutdown_trigger = shutdown.clone();
  let handler = tokio::task::spawn(async move {
    wait_for_termination().await;
    tracing::trace!("Termination signal detected, initiating graceful shutdown");
    shutdown_trigger.cancel();
  });
  (shutdown, handler)
}

#[cfg(unix)]
async fn wait_for_termination() {
  use tokio::signal::unix::{signal, SignalKind};
  match signal(SignalKind::terminate()) {
    Ok(mut terminate) => {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate.recv() => {},
      }
    }
    Err(e) => {
      tracing::warn!(error = ?e, "SIGTERM handler unavailable; only SIGINT stops this process");
      let _ = tokio::signal::ctrl_c().await;
    }
  }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
  let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
  use super::CancellationListener;
  use tokio_util::sync::CancellationToken;

  #[tokio::test]
  async fn listener_observes_cancellation() {
    let token = CancellationToken::new();
    let listener = CancellationListener::from(token.clone());
    assert!(!listener.is_cancelled());
    token.cancel();
    listener.cancelled().await;
    assert!(listener.is_cancelled());
  }
}
