// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Self-signed certificates for the TLS listener of each instance

use std::{
  io::Write,
  path::{Path, PathBuf},
};

#[derive(thiserror::Error, Debug)]
pub enum CertificateError {
  #[error("Certificate generation failed")]
  Generation(#[from] rcgen::RcgenError),
  #[error("Certificate file {path:?} could not be accessed")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Invalid PEM content in {path:?}: {reason}")]
  Pem { path: PathBuf, reason: String },
}

/// Locations of a PEM certificate chain and its private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
  pub cert: PathBuf,
  pub key: PathBuf,
}

pub trait CertificateBootstrap: std::fmt::Debug + Send + Sync {
  /// Returns the certificate for `port`, producing one first if none is available
  fn ensure_certificate(&self, port: u16) -> Result<CertificatePaths, CertificateError>;
}

pub const DEFAULT_CERTIFICATE_SUBJECT: &str = "localhost";
pub const CERTIFICATE_VALIDITY_DAYS: i64 = 365;

/// Generates per-port self-signed certificates in a directory, reusing existing ones
///
/// A pair is only regenerated when either of its files is missing.
#[derive(Debug, Clone)]
pub struct SelfSignedCertificates {
  dir: PathBuf,
  subject: String,
}

impl SelfSignedCertificates {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self {
      dir: dir.into(),
      subject: DEFAULT_CERTIFICATE_SUBJECT.to_string(),
    }
  }

  pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
    self.subject = subject.into();
    self
  }

  pub fn paths_for(&self, port: u16) -> CertificatePaths {
    CertificatePaths {
      cert: self.dir.join(format!("cert-{}.pem", port)),
      key: self.dir.join(format!("key-{}.pem", port)),
    }
  }

  fn generate(&self) -> Result<(String, String), CertificateError> {
    let mut params = rcgen::CertificateParams::new(vec![self.subject.clone()]);
    let mut name = rcgen::DistinguishedName::new();
    name.push(rcgen::DnType::CommonName, self.subject.as_str());
    params.distinguished_name = name;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(CERTIFICATE_VALIDITY_DAYS);
    let cert = rcgen::Certificate::from_params(params)?;
    Ok((cert.serialize_pem()?, cert.serialize_private_key_pem()))
  }
}

impl CertificateBootstrap for SelfSignedCertificates {
  #[tracing::instrument(level = "debug", skip(self), fields(dir = ?self.dir))]
  fn ensure_certificate(&self, port: u16) -> Result<CertificatePaths, CertificateError> {
    let paths = self.paths_for(port);
    if paths.cert.is_file() && paths.key.is_file() {
      tracing::debug!(cert = ?paths.cert, "Reusing existing certificate");
      return Ok(paths);
    }
    std::fs::create_dir_all(&self.dir).map_err(|source| CertificateError::Io {
      path: self.dir.clone(),
      source,
    })?;
    let (cert_pem, key_pem) = self.generate()?;
    write_file(&paths.key, key_pem.as_bytes(), 0o600)?;
    write_file(&paths.cert, cert_pem.as_bytes(), 0o644)?;
    tracing::info!(cert = ?paths.cert, key = ?paths.key, subject = %self.subject, "Generated self-signed certificate");
    Ok(paths)
  }
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), CertificateError> {
  let io_error = |source: std::io::Error| CertificateError::Io {
    path: path.to_path_buf(),
    source,
  };
  let mut options = std::fs::OpenOptions::new();
  options.write(true).create(true).truncate(true);
  #[cfg(unix)]
  {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(mode);
  }
  #[cfg(not(unix))]
  let _ = mode;
  let mut file = options.open(path).map_err(io_error)?;
  file.write_all(contents).map_err(io_error)?;
  file.sync_all().map_err(io_error)
}
