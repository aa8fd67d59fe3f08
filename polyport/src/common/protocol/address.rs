// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{
  net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
  str::FromStr,
};
use tokio::{
  io::{AsyncRead, AsyncReadExt},
  net::TcpStream,
};

/// SOCKS5 `ATYP` values
pub mod address_type {
  pub const IPV4: u8 = 0x01;
  pub const DOMAIN: u8 = 0x03;
  pub const IPV6: u8 = 0x04;
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Host {
  Ip(IpAddr),
  Domain(String),
}

/// A relay destination as requested by a client: a host and a port
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct TargetAddress {
  host: Host,
  port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum AddressDecodeError {
  #[error("Address type {0:#04x} is not supported")]
  UnsupportedType(u8),
  #[error("Domain name is not valid ASCII")]
  InvalidDomain,
  #[error("Address truncated")]
  Truncated(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AddressParseError {
  #[error("Target addresses must be given as host:port")]
  MissingPort,
  #[error("Target port must be a number between 0 and 65535")]
  InvalidPort,
  #[error("Target host must not be empty")]
  EmptyHost,
  #[error("Target host is longer than 255 bytes")]
  HostTooLong,
}

impl TargetAddress {
  pub fn new(host: Host, port: u16) -> Self {
    Self { host, port }
  }

  pub fn host(&self) -> &Host {
    &self.host
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  /// Reads `DST.ADDR` and `DST.PORT` of a SOCKS5 request whose `ATYP` was already consumed.
  ///
  /// Nothing is read for an unknown address type, as its length cannot be known.
  pub async fn read_socks5<R: AsyncRead + Unpin>(
    reader: &mut R,
    address_type: u8,
  ) -> Result<Self, AddressDecodeError> {
    let host = match address_type {
      address_type::IPV4 => {
        let mut octets = [0u8; 4];
        reader.read_exact(&mut octets).await?;
        Host::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
      }
      address_type::IPV6 => {
        let mut octets = [0u8; 16];
        reader.read_exact(&mut octets).await?;
        Host::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
      }
      address_type::DOMAIN => {
        let length = reader.read_u8().await? as usize;
        let mut raw = vec![0u8; length];
        reader.read_exact(&mut raw).await?;
        if !raw.is_ascii() {
          return Err(AddressDecodeError::InvalidDomain);
        }
        let domain = String::from_utf8(raw).map_err(|_| AddressDecodeError::InvalidDomain)?;
        // Some clients send literal addresses with the domain type
        match domain.parse::<IpAddr>() {
          Ok(ip) => Host::Ip(ip),
          Err(_) => Host::Domain(domain),
        }
      }
      other => return Err(AddressDecodeError::UnsupportedType(other)),
    };
    let port = reader.read_u16().await?;
    Ok(Self { host, port })
  }

  /// Resolves (when needed) and opens a TCP connection to this target
  pub async fn connect(&self) -> std::io::Result<TcpStream> {
    match &self.host {
      Host::Ip(ip) => TcpStream::connect(SocketAddr::new(*ip, self.port)).await,
      Host::Domain(domain) => TcpStream::connect((domain.as_str(), self.port)).await,
    }
  }
}

impl From<SocketAddr> for TargetAddress {
  fn from(addr: SocketAddr) -> Self {
    Self::new(Host::Ip(addr.ip()), addr.port())
  }
}

impl std::fmt::Display for TargetAddress {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.host {
      Host::Ip(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
      Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
      Host::Domain(domain) => write!(f, "{}:{}", domain, self.port),
    }
  }
}

impl FromStr for TargetAddress {
  type Err = AddressParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
      return Ok(addr.into());
    }
    let (host, port) = s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
    let port = port
      .parse::<u16>()
      .map_err(|_| AddressParseError::InvalidPort)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
      return Err(AddressParseError::EmptyHost);
    }
    if host.len() > 255 {
      return Err(AddressParseError::HostTooLong);
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
      return Ok(Self::new(Host::Ip(ip), port));
    }
    if host.contains(':') {
      // An unbracketed IPv6 literal with no port, such as "::1"
      return Err(AddressParseError::MissingPort);
    }
    Ok(Self::new(Host::Domain(host.to_string()), port))
  }
}

#[cfg(test)]
mod tests {
  use std::net::{IpAddr, Ipv4Addr};

  use super::{address_type, AddressDecodeError, AddressParseError, Host, TargetAddress};

  #[tokio::test]
  async fn ipv4_request_renders_dotted_quad() {
    let mut wire: &[u8] = &[127, 0, 0, 1, 0x00, 0x50];
    let target = TargetAddress::read_socks5(&mut wire, address_type::IPV4)
      .await
      .unwrap();
    assert_eq!(target.to_string(), "127.0.0.1:80");
    assert!(wire.is_empty(), "All address bytes must be consumed");
  }

  #[tokio::test]
  async fn domain_request_uses_length_prefixed_bytes() {
    let mut wire = vec![11u8];
    wire.extend_from_slice(b"example.com");
    wire.extend_from_slice(&443u16.to_be_bytes());
    wire.extend_from_slice(b"trailing");
    let mut reader: &[u8] = &wire;
    let target = TargetAddress::read_socks5(&mut reader, address_type::DOMAIN)
      .await
      .unwrap();
    assert_eq!(target.host(), &Host::Domain("example.com".into()));
    assert_eq!(target.port(), 443);
    assert_eq!(reader, b"trailing");
  }

  #[tokio::test]
  async fn ipv6_request_is_bracketed() {
    let mut wire = vec![0u8; 15];
    wire.push(1);
    wire.extend_from_slice(&8443u16.to_be_bytes());
    let mut reader: &[u8] = &wire;
    let target = TargetAddress::read_socks5(&mut reader, address_type::IPV6)
      .await
      .unwrap();
    assert_eq!(target.to_string(), "[::1]:8443");
  }

  #[tokio::test]
  async fn unknown_address_type_is_rejected_without_reading() {
    let mut reader: &[u8] = &[1, 2, 3];
    let err = TargetAddress::read_socks5(&mut reader, 0x02)
      .await
      .unwrap_err();
    assert!(matches!(err, AddressDecodeError::UnsupportedType(0x02)));
    assert_eq!(reader.len(), 3);
  }

  #[tokio::test]
  async fn truncated_address_fails() {
    let mut reader: &[u8] = &[10, 0];
    let err = TargetAddress::read_socks5(&mut reader, address_type::IPV4)
      .await
      .unwrap_err();
    assert!(matches!(err, AddressDecodeError::Truncated(_)));
  }

  #[test]
  fn parses_host_port_forms() {
    assert_eq!(
      "example.com:443".parse::<TargetAddress>().unwrap(),
      TargetAddress::new(Host::Domain("example.com".into()), 443)
    );
    assert_eq!(
      "10.1.2.3:22".parse::<TargetAddress>().unwrap(),
      TargetAddress::new(Host::Ip(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))), 22)
    );
    assert_eq!(
      "[::1]:80".parse::<TargetAddress>().unwrap().to_string(),
      "[::1]:80"
    );
    assert!(matches!("example.com".parse::<TargetAddress>(), Err(AddressParseError::MissingPort)));
    assert!(matches!("example.com:http".parse::<TargetAddress>(), Err(AddressParseError::InvalidPort)));
    assert!(matches!(":80".parse::<TargetAddress>(), Err(AddressParseError::EmptyHost)));
  }
}
