// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use polyport::common::certificate::{CertificateBootstrap, SelfSignedCertificates};
use std::path::PathBuf;
use tracing::instrument;

/// Provisions the certificate a worker on `port` would serve, printing where it lives
#[instrument]
pub async fn certgen_main(cert_dir: PathBuf, port: u16, host_san: String) -> Result<()> {
  let certificates = SelfSignedCertificates::new(cert_dir).with_subject(host_san);
  let paths = tokio::task::spawn_blocking(move || certificates.ensure_certificate(port))
    .await
    .context("Certificate task panicked")?
    .context("Certificate generation failed")?;
  println!("Certificate: {}", paths.cert.display());
  println!("Private key: {}", paths.key.display());
  Ok(())
}
