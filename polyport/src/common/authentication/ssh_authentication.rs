// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{ffi::OsString, process::Stdio, time::Duration};

use futures::future::{BoxFuture, FutureExt};

use super::traits::*;
use crate::util::session_stream::SessionStream;

pub const DEFAULT_SSH_AUTHENTICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Delegates the session decision to a non-interactive `ssh` invocation
///
/// The agent's standard output is forwarded to the client; its standard input is closed so
/// that the client's pending protocol bytes stay in the session stream. A zero exit status
/// admits the session.
pub struct SshAuthenticationHandler {
  program: OsString,
  args: Vec<OsString>,
  timeout: Duration,
}

impl SshAuthenticationHandler {
  pub fn new(host: impl Into<String>) -> Self {
    let host: String = host.into();
    Self::with_command(
      "ssh",
      [
        "-o",
        "BatchMode=yes",
        "-o",
        "StrictHostKeyChecking=no",
        host.as_str(),
        "true",
      ],
    )
  }

  /// Runs an arbitrary agent in place of `ssh`
  pub fn with_command<P, I, A>(program: P, args: I) -> Self
  where
    P: Into<OsString>,
    I: IntoIterator<Item = A>,
    A: Into<OsString>,
  {
    Self {
      program: program.into(),
      args: args.into_iter().map(Into::into).collect(),
      timeout: DEFAULT_SSH_AUTHENTICATION_TIMEOUT,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }
}

impl std::fmt::Debug for SshAuthenticationHandler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SshAuthenticationHandler")
      .field("program", &self.program)
      .field("args", &self.args)
      .field("timeout", &self.timeout)
      .finish()
  }
}

impl AuthenticationHandler for SshAuthenticationHandler {
  fn authenticate<'a>(
    &'a self,
    stream: &'a mut (dyn SessionStream + 'a),
  ) -> BoxFuture<'a, Result<(), AuthenticationError>> {
    async move {
      let mut child = tokio::process::Command::new(&self.program)
        .args(&self.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(AuthenticationError::Spawn)?;
      let exchange = async {
        if let Some(mut output) = child.stdout.take() {
          tokio::io::copy(&mut output, &mut *stream).await?;
        }
        child.wait().await
      };
      let status = match tokio::time::timeout(self.timeout, exchange).await {
        Ok(status) => status?,
        Err(_elapsed) => {
          tracing::warn!(timeout = ?self.timeout, "Authentication agent timed out");
          return Err(AuthenticationError::Timeout);
        }
      };
      if status.success() {
        tracing::debug!("Authentication agent admitted session");
        Ok(())
      } else {
        tracing::info!(code = ?status.code(), "Authentication agent rejected session");
        Err(AuthenticationError::Rejected(status.code()))
      }
    }
    .boxed()
  }
}
