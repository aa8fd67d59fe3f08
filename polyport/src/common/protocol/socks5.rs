// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! SOCKS5 `CONNECT` relay, without username/password negotiation

use std::{sync::Arc, time::Duration};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{address::TargetAddress, dial, SessionError};
use crate::{
  common::authentication::{AuthenticationHandler, NoOpAuthenticationHandler},
  util::{relay, session_stream::SessionStream, RelayStats},
};

pub const SOCKS5_VERSION: u8 = 0x05;
pub const NO_AUTHENTICATION_REQUIRED: u8 = 0x00;
pub const COMMAND_CONNECT: u8 = 0x01;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on each of the greeting and the connect request
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// `REP` values of a SOCKS5 reply
pub mod reply {
  pub const SUCCEEDED: u8 = 0x00;
  pub const CONNECTION_REFUSED: u8 = 0x05;
  pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
  pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

#[derive(Debug, Clone)]
pub struct Socks5Handler {
  authenticator: Arc<dyn AuthenticationHandler>,
  dial_timeout: Duration,
  handshake_timeout: Duration,
}

impl Default for Socks5Handler {
  fn default() -> Self {
    Self::new(
      Arc::new(NoOpAuthenticationHandler::new()),
      DEFAULT_DIAL_TIMEOUT,
    )
  }
}

impl Socks5Handler {
  pub fn new(authenticator: Arc<dyn AuthenticationHandler>, dial_timeout: Duration) -> Self {
    Self {
      authenticator,
      dial_timeout,
      handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
    }
  }

  pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
    self.handshake_timeout = handshake_timeout;
    self
  }

  /// Runs a SOCKS5 session from its greeting through to the end of the relay
  ///
  /// `stream` must yield the client's greeting as its first bytes.
  pub async fn handle<S>(&self, mut stream: S) -> Result<RelayStats, SessionError>
  where
    S: SessionStream,
  {
    self
      .within_handshake(Self::accept_greeting(&mut stream))
      .await?;
    self.authenticator.authenticate(&mut stream).await?;
    let target = self
      .within_handshake(Self::read_request(&mut stream))
      .await?;
    tracing::debug!(%target, "SOCKS5 connect requested");
    let outbound = match dial(&target, self.dial_timeout).await {
      Ok(outbound) => outbound,
      Err(e) => {
        tracing::info!(%target, error = %e, "SOCKS5 target unreachable");
        let _ = write_reply(&mut stream, reply::CONNECTION_REFUSED).await;
        return Err(e);
      }
    };
    write_reply(&mut stream, reply::SUCCEEDED).await?;
    let stats = relay(stream, outbound).await?;
    tracing::debug!(%target, sent = stats.a_to_b, received = stats.b_to_a, "SOCKS5 relay closed");
    Ok(stats)
  }

  async fn within_handshake<T, F>(&self, step: F) -> Result<T, SessionError>
  where
    F: std::future::Future<Output = Result<T, SessionError>>,
  {
    match tokio::time::timeout(self.handshake_timeout, step).await {
      Ok(outcome) => outcome,
      Err(_elapsed) => Err(SessionError::Timeout("SOCKS5 handshake")),
    }
  }

  async fn accept_greeting<S: SessionStream>(stream: &mut S) -> Result<(), SessionError> {
    let version = stream.read_u8().await?;
    if version != SOCKS5_VERSION {
      return Err(SessionError::Handshake(format!(
        "SOCKS version {:#04x} is not supported",
        version
      )));
    }
    let method_count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; method_count];
    stream.read_exact(&mut methods).await?;
    tracing::trace!(?methods, "SOCKS5 greeting");
    // Only "no authentication" is offered, regardless of what the client listed
    stream
      .write_all(&[SOCKS5_VERSION, NO_AUTHENTICATION_REQUIRED])
      .await?;
    stream.flush().await?;
    Ok(())
  }

  async fn read_request<S: SessionStream>(stream: &mut S) -> Result<TargetAddress, SessionError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, address_type] = header;
    if version != SOCKS5_VERSION {
      return Err(SessionError::Handshake(format!(
        "SOCKS request version {:#04x} is not supported",
        version
      )));
    }
    if command != COMMAND_CONNECT {
      write_reply(stream, reply::COMMAND_NOT_SUPPORTED).await?;
      return Err(SessionError::UnsupportedCommand(command));
    }
    match TargetAddress::read_socks5(stream, address_type).await {
      Ok(target) => Ok(target),
      Err(e) => {
        let e = SessionError::from(e);
        if let SessionError::UnsupportedAddressType(_) = e {
          write_reply(stream, reply::ADDRESS_TYPE_NOT_SUPPORTED).await?;
        }
        Err(e)
      }
    }
  }
}

/// Writes a reply with an all-zero IPv4 bound address
async fn write_reply<S: SessionStream>(stream: &mut S, code: u8) -> std::io::Result<()> {
  stream
    .write_all(&[SOCKS5_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
    .await?;
  stream.flush().await
}
