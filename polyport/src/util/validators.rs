// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::time::Duration;

use crate::common::protocol::address::TargetAddress;

/// Parses a listening port; zero is refused as it cannot identify an instance
pub fn parse_port(v: &str) -> Result<u16> {
  match v.trim().parse::<u16>() {
    Ok(0) => Err(AnyErr::msg("Port must be between 1 and 65535")),
    Ok(port) => Ok(port),
    Err(_) => Err(AnyErr::msg("Port must be a number between 1 and 65535")),
  }
}

pub fn parse_ipaddr(v: &str) -> Result<std::net::IpAddr> {
  use std::net::{Ipv4Addr, Ipv6Addr};
  match v.parse::<Ipv4Addr>() {
    Ok(addr) => Ok(addr.into()),
    Err(_) => match v.parse::<Ipv6Addr>() {
      Ok(addr) => Ok(addr.into()),
      Err(_) => Err(anyhow::Error::msg(
        "Could not parse input as ipv4 or ipv6 address",
      )),
    },
  }
}

pub fn parse_target(v: &str) -> Result<TargetAddress> {
  v.parse::<TargetAddress>().map_err(Into::into)
}

pub fn parse_seconds(v: &str) -> Result<Duration> {
  match v.parse::<u64>() {
    Ok(0) => Err(AnyErr::msg("Timeouts must be at least one second")),
    Ok(secs) => Ok(Duration::from_secs(secs)),
    Err(_) => Err(AnyErr::msg("Timeouts must be a whole number of seconds")),
  }
}

pub fn validate_port(v: &str) -> Result<(), String> {
  parse_port(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_ipaddr(v: &str) -> Result<(), String> {
  parse_ipaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_target(v: &str) -> Result<(), String> {
  parse_target(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_seconds(v: &str) -> Result<(), String> {
  parse_seconds(v).map(|_| ()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn port_bounds() {
    assert_eq!(parse_port("8080").unwrap(), 8080);
    assert_eq!(parse_port(" 1 ").unwrap(), 1);
    assert_eq!(parse_port("65535").unwrap(), 65535);
    assert!(parse_port("0").is_err());
    assert!(parse_port("65536").is_err());
    assert!(parse_port("http").is_err());
  }

  #[test]
  fn seconds_must_be_positive() {
    assert_eq!(parse_seconds("5").unwrap(), Duration::from_secs(5));
    assert!(parse_seconds("0").is_err());
    assert!(validate_seconds("-1").is_err());
  }
}
