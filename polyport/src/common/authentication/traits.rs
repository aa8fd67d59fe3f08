// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::BoxFuture;

use crate::util::session_stream::SessionStream;

#[derive(thiserror::Error, Debug)]
pub enum AuthenticationError {
  #[error("Authentication agent could not be started")]
  Spawn(#[source] std::io::Error),
  #[error("Authentication agent rejected the session (exit code {0:?})")]
  Rejected(Option<i32>),
  #[error("Authentication agent did not finish in time")]
  Timeout,
  #[error("Authentication agent I/O failure")]
  Io(#[from] std::io::Error),
}

/// Decides whether a client session may proceed to relaying
///
/// Runs after a protocol greeting and before the relay target is dialed; an `Err` aborts the
/// session. Implementations may exchange bytes with the client over `stream`.
pub trait AuthenticationHandler: std::fmt::Debug + Send + Sync {
  fn authenticate<'a>(
    &'a self,
    stream: &'a mut (dyn SessionStream + 'a),
  ) -> BoxFuture<'a, Result<(), AuthenticationError>>;
}
