// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::Result;
use futures::future::TryFutureExt;
use polyport::{
  common::certificate::SelfSignedCertificates, config::ServeConfig, server::serve_port,
  util::cancellation::shutdown_on_signals,
};
use std::path::PathBuf;

/// Parameters used to run a single polyport listener in the foreground
#[derive(Clone, Debug)]
pub struct ServerArgs {
  pub config: ServeConfig,
  pub cert_dir: PathBuf,
}

/// Serve one port until SIGINT or SIGTERM arrives
#[tracing::instrument(
  skip(args),
  fields(
    port = args.config.port,
    bind = %args.config.bind_address,
    tls = %args.config.tls,
  ),
  err
)]
pub async fn server_main(args: self::ServerArgs) -> Result<()> {
  let (shutdown, signal_handler_task) = shutdown_on_signals();
  let certificates = SelfSignedCertificates::new(args.cert_dir);

  let served = serve_port(args.config, &certificates, shutdown.clone().into())
    .map_err(anyhow::Error::from)
    .await;

  signal_handler_task.abort();
  let _cancelled = signal_handler_task.await;

  served?;
  tracing::info!("Listener shut down");
  Ok(())
}
