// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

use tokio::net::TcpStream;

use self::address::{AddressDecodeError, TargetAddress};
use crate::common::authentication::AuthenticationError;

pub mod address;
pub mod sniff;
pub mod socks5;
pub mod tunnel;

/// The protocol a client appears to be speaking, judged from its first bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
  Socks5,
  /// HTTP `CONNECT` or a WebSocket upgrade request
  Tunnel,
  /// Anything else; still handed to the tunnel handler, which relays it to the fallback target
  Unrecognized,
}

impl std::fmt::Display for ProtocolKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      ProtocolKind::Socks5 => "socks5",
      ProtocolKind::Tunnel => "tunnel",
      ProtocolKind::Unrecognized => "unrecognized",
    })
  }
}

/// Failures confined to a single client connection
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
  #[error("Protocol handshake failed: {0}")]
  Handshake(String),
  #[error("Address type {0:#04x} is not supported")]
  UnsupportedAddressType(u8),
  #[error("Command {0:#04x} is not supported")]
  UnsupportedCommand(u8),
  #[error("Could not reach {target}")]
  Dial {
    target: TargetAddress,
    #[source]
    source: std::io::Error,
  },
  #[error("Session authentication failed")]
  Authentication(#[from] AuthenticationError),
  #[error("Timed out during {0}")]
  Timeout(&'static str),
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl From<AddressDecodeError> for SessionError {
  fn from(e: AddressDecodeError) -> Self {
    match e {
      AddressDecodeError::UnsupportedType(atyp) => SessionError::UnsupportedAddressType(atyp),
      AddressDecodeError::InvalidDomain => {
        SessionError::Handshake("Requested domain name is not valid ASCII".into())
      }
      AddressDecodeError::Truncated(io) => SessionError::Io(io),
    }
  }
}

/// Opens an outbound connection, bounded by `dial_timeout`
pub(crate) async fn dial(
  target: &TargetAddress,
  dial_timeout: Duration,
) -> Result<TcpStream, SessionError> {
  match tokio::time::timeout(dial_timeout, target.connect()).await {
    Ok(Ok(stream)) => {
      let _ = stream.set_nodelay(true);
      Ok(stream)
    }
    Ok(Err(source)) => Err(SessionError::Dial {
      target: target.clone(),
      source,
    }),
    Err(_elapsed) => Err(SessionError::Dial {
      target: target.clone(),
      source: std::io::Error::new(std::io::ErrorKind::TimedOut, "Dial timed out"),
    }),
  }
}
