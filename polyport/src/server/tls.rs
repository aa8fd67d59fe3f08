// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use tokio_rustls::TlsAcceptor;

use super::ServeError;
use crate::common::certificate::{CertificateError, CertificatePaths};

/// Builds a TLS acceptor serving the PEM certificate chain and private key at `paths`
pub fn acceptor_from_pem(paths: &CertificatePaths) -> Result<TlsAcceptor, ServeError> {
  let chain = load_certificates(&paths.cert)?;
  let key = load_private_key(&paths.key)?;
  let config = rustls::ServerConfig::builder()
    .with_safe_defaults()
    .with_no_client_auth()
    .with_single_cert(chain, key)?;
  Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &Path) -> Result<BufReader<File>, CertificateError> {
  File::open(path)
    .map(BufReader::new)
    .map_err(|source| CertificateError::Io {
      path: path.to_path_buf(),
      source,
    })
}

pub(crate) fn load_certificates(path: &Path) -> Result<Vec<rustls::Certificate>, CertificateError> {
  let mut reader = open(path)?;
  let chain = rustls_pemfile::certs(&mut reader).map_err(|e| CertificateError::Pem {
    path: path.to_path_buf(),
    reason: e.to_string(),
  })?;
  if chain.is_empty() {
    return Err(CertificateError::Pem {
      path: path.to_path_buf(),
      reason: "no certificates found".into(),
    });
  }
  Ok(chain.into_iter().map(rustls::Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<rustls::PrivateKey, CertificateError> {
  let mut reader = open(path)?;
  loop {
    let item = rustls_pemfile::read_one(&mut reader).map_err(|e| CertificateError::Pem {
      path: path.to_path_buf(),
      reason: e.to_string(),
    })?;
    match item {
      Some(rustls_pemfile::Item::PKCS8Key(key))
      | Some(rustls_pemfile::Item::RSAKey(key))
      | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(rustls::PrivateKey(key)),
      Some(_) => continue,
      None => {
        return Err(CertificateError::Pem {
          path: path.to_path_buf(),
          reason: "no private key found".into(),
        })
      }
    }
  }
}
