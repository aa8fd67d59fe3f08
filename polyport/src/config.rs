// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! File locations and per-listener settings shared by the supervisor and its workers

use std::{
  net::{IpAddr, Ipv4Addr},
  path::{Path, PathBuf},
  str::FromStr,
  time::Duration,
};

use crate::common::protocol::{
  address::TargetAddress,
  socks5::{DEFAULT_DIAL_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT},
  tunnel::DEFAULT_FALLBACK_TARGET,
};

pub const STATE_DIR_ENV: &str = "POLYPORT_STATE_DIR";
pub const LOG_DIR_ENV: &str = "POLYPORT_LOG_DIR";
pub const CERT_DIR_ENV: &str = "POLYPORT_CERT_DIR";

pub const DEFAULT_STATE_DIR: &str = "/opt/polyport";
pub const DEFAULT_LOG_DIR: &str = "/var/log";
pub const DEFAULT_CERT_DIR: &str = "/tmp";
pub const STATE_FILE_NAME: &str = "ports.json";

pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the registry, per-instance logs, and per-instance certificates live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
  pub state_file: PathBuf,
  pub log_dir: PathBuf,
  pub cert_dir: PathBuf,
}

impl Default for InstancePaths {
  fn default() -> Self {
    Self {
      state_file: Path::new(DEFAULT_STATE_DIR).join(STATE_FILE_NAME),
      log_dir: PathBuf::from(DEFAULT_LOG_DIR),
      cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
    }
  }
}

impl InstancePaths {
  /// Defaults, overridden by any of the `POLYPORT_*_DIR` variables that are set
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var_os(key).filter(|v| !v.is_empty()))
  }

  fn from_lookup(lookup: impl Fn(&str) -> Option<std::ffi::OsString>) -> Self {
    let mut paths = Self::default();
    if let Some(dir) = lookup(STATE_DIR_ENV) {
      paths.state_file = PathBuf::from(dir).join(STATE_FILE_NAME);
    }
    if let Some(dir) = lookup(LOG_DIR_ENV) {
      paths.log_dir = dir.into();
    }
    if let Some(dir) = lookup(CERT_DIR_ENV) {
      paths.cert_dir = dir.into();
    }
    paths
  }

  pub fn with_state_dir(mut self, dir: impl AsRef<Path>) -> Self {
    self.state_file = dir.as_ref().join(STATE_FILE_NAME);
    self
  }

  pub fn state_dir(&self) -> &Path {
    self.state_file.parent().unwrap_or_else(|| Path::new("."))
  }

  pub fn log_file(&self, port: u16) -> PathBuf {
    self.log_dir.join(format!("polyport-{}.log", port))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
  /// Plain TCP only
  Disabled,
  /// Every connection must complete a TLS handshake
  Required,
  /// TLS only for connections opening with a TLS handshake record
  #[default]
  Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthPolicy {
  #[default]
  None,
  /// Delegate each SOCKS5 session to an `ssh` probe
  Ssh,
}

#[derive(thiserror::Error, Debug)]
#[error("Unknown {kind} policy {value:?}; expected one of {expected}")]
pub struct PolicyParseError {
  kind: &'static str,
  value: String,
  expected: &'static str,
}

impl TlsPolicy {
  pub const NAMES: &'static [&'static str] = &["disabled", "required", "auto"];
}

impl AuthPolicy {
  pub const NAMES: &'static [&'static str] = &["none", "ssh"];
}

impl FromStr for TlsPolicy {
  type Err = PolicyParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "disabled" | "off" => Ok(TlsPolicy::Disabled),
      "required" | "on" => Ok(TlsPolicy::Required),
      "auto" => Ok(TlsPolicy::Auto),
      _ => Err(PolicyParseError {
        kind: "TLS",
        value: s.to_string(),
        expected: "disabled, required, auto",
      }),
    }
  }
}

impl std::fmt::Display for TlsPolicy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      TlsPolicy::Disabled => "disabled",
      TlsPolicy::Required => "required",
      TlsPolicy::Auto => "auto",
    })
  }
}

impl FromStr for AuthPolicy {
  type Err = PolicyParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "none" => Ok(AuthPolicy::None),
      "ssh" => Ok(AuthPolicy::Ssh),
      _ => Err(PolicyParseError {
        kind: "authentication",
        value: s.to_string(),
        expected: "none, ssh",
      }),
    }
  }
}

impl std::fmt::Display for AuthPolicy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      AuthPolicy::None => "none",
      AuthPolicy::Ssh => "ssh",
    })
  }
}

/// Settings for one listening worker
#[derive(Debug, Clone)]
pub struct ServeConfig {
  pub port: u16,
  pub bind_address: IpAddr,
  pub tls: TlsPolicy,
  pub auth: AuthPolicy,
  /// Host probed by the `ssh` authentication agent
  pub ssh_host: String,
  pub fallback_target: TargetAddress,
  pub handshake_timeout: Duration,
  pub sniff_timeout: Duration,
  pub dial_timeout: Duration,
}

impl ServeConfig {
  pub fn new(port: u16) -> Self {
    Self {
      port,
      bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
      tls: TlsPolicy::default(),
      auth: AuthPolicy::default(),
      ssh_host: "localhost".to_string(),
      fallback_target: DEFAULT_FALLBACK_TARGET.into(),
      handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
      sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
      dial_timeout: DEFAULT_DIAL_TIMEOUT,
    }
  }

  /// Bound for reading a tunnel request head once the session was classified
  pub fn head_timeout(&self) -> Duration {
    self.sniff_timeout
  }
}
