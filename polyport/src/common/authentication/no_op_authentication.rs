// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};

use super::traits::*;
use crate::util::session_stream::SessionStream;

/// Accepts every session without exchanging any bytes
#[derive(Default)]
pub struct NoOpAuthenticationHandler {}

impl NoOpAuthenticationHandler {
  pub fn new() -> NoOpAuthenticationHandler {
    NoOpAuthenticationHandler {}
  }
}

impl std::fmt::Debug for NoOpAuthenticationHandler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "({})",
      std::any::type_name::<NoOpAuthenticationHandler>()
    )
  }
}

impl AuthenticationHandler for NoOpAuthenticationHandler {
  fn authenticate<'a>(
    &'a self,
    _stream: &'a mut (dyn SessionStream + 'a),
  ) -> BoxFuture<'a, Result<(), AuthenticationError>> {
    futures::future::ready(Ok(())).boxed()
  }
}
