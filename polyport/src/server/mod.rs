// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Accepting client connections, detecting their protocol, and routing them to a handler

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::{io::AsyncReadExt, net::TcpListener};
use tokio_rustls::TlsAcceptor;
use tracing_futures::Instrument;

use crate::{
  common::{
    authentication::{AuthenticationHandler, NoOpAuthenticationHandler, SshAuthenticationHandler},
    certificate::{CertificateBootstrap, CertificateError},
    protocol::{
      sniff::{sniff, ReplayStream},
      socks5::Socks5Handler,
      tunnel::TunnelHandler,
      ProtocolKind, SessionError,
    },
  },
  config::{AuthPolicy, ServeConfig, TlsPolicy},
  util::{
    cancellation::CancellationListener,
    session_stream::{BoxedSessionStream, SessionStream},
    RelayStats,
  },
};

pub mod tls;

/// First byte of a TLS record carrying a handshake message
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Pause after a failed `accept`, so descriptor exhaustion does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Failures that prevent a worker from serving at all
#[derive(thiserror::Error, Debug)]
pub enum ServeError {
  #[error("Could not listen on {addr}")]
  Bind {
    addr: SocketAddr,
    #[source]
    source: std::io::Error,
  },
  #[error("Certificate unavailable")]
  Certificate(#[from] CertificateError),
  #[error("TLS configuration rejected")]
  Tls(#[from] rustls::Error),
}

/// Per-connection pipeline: optional TLS, sniffing, then the SOCKS5 or tunnel handler
pub struct Dispatcher {
  tls_policy: TlsPolicy,
  tls_acceptor: Option<TlsAcceptor>,
  handshake_timeout: Duration,
  sniff_timeout: Duration,
  socks5: Socks5Handler,
  tunnel: TunnelHandler,
}

impl std::fmt::Debug for Dispatcher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Dispatcher")
      .field("tls_policy", &self.tls_policy)
      .field("handshake_timeout", &self.handshake_timeout)
      .field("sniff_timeout", &self.sniff_timeout)
      .field("socks5", &self.socks5)
      .field("tunnel", &self.tunnel)
      .finish_non_exhaustive()
  }
}

impl Dispatcher {
  /// A TLS policy other than [TlsPolicy::Disabled] requires `tls_acceptor`; without one the
  /// dispatcher serves plain TCP.
  pub fn new(config: &ServeConfig, tls_acceptor: Option<TlsAcceptor>) -> Self {
    let tls_policy = match (config.tls, &tls_acceptor) {
      (TlsPolicy::Disabled, _) => TlsPolicy::Disabled,
      (policy, Some(_)) => policy,
      (policy, None) => {
        tracing::warn!(%policy, "No TLS acceptor available; serving plain TCP only");
        TlsPolicy::Disabled
      }
    };
    let authenticator: Arc<dyn AuthenticationHandler> = match config.auth {
      AuthPolicy::None => Arc::new(NoOpAuthenticationHandler::new()),
      AuthPolicy::Ssh => Arc::new(SshAuthenticationHandler::new(config.ssh_host.clone())),
    };
    Self {
      tls_policy,
      tls_acceptor,
      handshake_timeout: config.handshake_timeout,
      sniff_timeout: config.sniff_timeout,
      socks5: Socks5Handler::new(authenticator, config.dial_timeout)
        .with_handshake_timeout(config.handshake_timeout),
      tunnel: TunnelHandler::new(
        config.fallback_target.clone(),
        config.dial_timeout,
        config.head_timeout(),
      ),
    }
  }

  pub fn tls_policy(&self) -> TlsPolicy {
    self.tls_policy
  }

  /// Accepts connections until `shutdown` fires, serving each on its own task
  ///
  /// Connections already being served are left to finish on their own.
  pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationListener) {
    let local_addr = listener.local_addr().ok();
    let shutdown_signal = async move { shutdown.cancelled().await };
    tokio_stream::wrappers::TcpListenerStream::new(listener)
      .take_until(shutdown_signal)
      .for_each(|accepted| {
        let dispatcher = Arc::clone(&self);
        async move {
          match accepted {
            Ok(stream) => {
              let peer = stream.peer_addr().ok();
              let _ = stream.set_nodelay(true);
              let span = tracing::info_span!("connection", peer = ?peer);
              tokio::task::spawn(
                async move {
                  match dispatcher.handle_connection(stream).await {
                    Ok(stats) => tracing::debug!(
                      sent = stats.a_to_b,
                      received = stats.b_to_a,
                      "Connection closed"
                    ),
                    Err(e) => log_session_error(&e),
                  }
                }
                .instrument(span),
              );
            }
            Err(e) => {
              tracing::warn!(error = ?e, "Failed to accept connection");
              tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
          }
        }
      })
      .await;
    tracing::info!(addr = ?local_addr, "Listener stopped accepting connections");
  }

  /// Serves one client connection through to the end of its relay
  pub async fn handle_connection<S>(&self, stream: S) -> Result<RelayStats, SessionError>
  where
    S: SessionStream + 'static,
  {
    let deadline = tokio::time::Instant::now() + self.sniff_timeout;
    let (stream, deadline) = self.secure_upgrade(stream, deadline).await?;
    let (kind, stream) = sniff(stream, deadline).await?;
    tracing::debug!(protocol = %kind, "Session classified");
    match kind {
      ProtocolKind::Socks5 => self.socks5.handle(stream).await,
      ProtocolKind::Tunnel => self.tunnel.handle(stream, kind).await,
      ProtocolKind::Unrecognized => {
        tracing::warn!(
          fallback = %self.tunnel.fallback_target(),
          "Unrecognized protocol; relaying to fallback target"
        );
        self.tunnel.handle(stream, kind).await
      }
    }
  }

  /// Wraps `stream` in TLS as the policy demands
  ///
  /// Returns the deadline for sniffing what follows: the plaintext peek under [TlsPolicy::Auto]
  /// spends from `deadline`, while an established TLS session starts a fresh one.
  async fn secure_upgrade<S>(
    &self,
    mut stream: S,
    deadline: tokio::time::Instant,
  ) -> Result<(BoxedSessionStream, tokio::time::Instant), SessionError>
  where
    S: SessionStream + 'static,
  {
    let acceptor = match (self.tls_policy, &self.tls_acceptor) {
      (TlsPolicy::Disabled, _) | (_, None) => return Ok((Box::new(stream), deadline)),
      (_, Some(acceptor)) => acceptor,
    };
    let stream: BoxedSessionStream = if self.tls_policy == TlsPolicy::Auto {
      let mut first = [0u8; 1];
      let peeked = match tokio::time::timeout_at(deadline, stream.read(&mut first)).await {
        Ok(Ok(0)) | Err(_) => Vec::new(),
        Ok(Ok(_)) => first.to_vec(),
        Ok(Err(e)) => return Err(e.into()),
      };
      let is_tls = peeked.first() == Some(&TLS_HANDSHAKE_RECORD);
      let stream = ReplayStream::new(peeked, stream);
      if !is_tls {
        tracing::trace!("Plaintext session");
        return Ok((Box::new(stream), deadline));
      }
      Box::new(stream)
    } else {
      Box::new(stream)
    };
    let tls = self.accept_tls(acceptor, stream).await?;
    Ok((tls, tokio::time::Instant::now() + self.sniff_timeout))
  }

  async fn accept_tls<S>(
    &self,
    acceptor: &TlsAcceptor,
    stream: S,
  ) -> Result<BoxedSessionStream, SessionError>
  where
    S: SessionStream + 'static,
  {
    match tokio::time::timeout(self.handshake_timeout, acceptor.accept(stream)).await {
      Ok(Ok(tls)) => {
        tracing::trace!("TLS session established");
        Ok(Box::new(tls))
      }
      Ok(Err(e)) => Err(SessionError::Handshake(format!("TLS handshake failed: {}", e))),
      Err(_elapsed) => Err(SessionError::Timeout("TLS handshake")),
    }
  }
}

fn log_session_error(e: &SessionError) {
  match e {
    SessionError::Authentication(_) => tracing::warn!(error = %e, "Session refused"),
    SessionError::Dial { .. } => tracing::info!(error = %e, "Session ended without relay"),
    SessionError::Handshake(_)
    | SessionError::UnsupportedAddressType(_)
    | SessionError::UnsupportedCommand(_)
    | SessionError::Timeout(_) => tracing::debug!(error = %e, "Session rejected"),
    SessionError::Io(_) => tracing::debug!(error = %e, "Session I/O failure"),
  }
}

/// Binds the configured port and serves it until `shutdown` fires
///
/// Fails only when serving cannot begin: the certificate is unusable or the port is taken.
#[tracing::instrument(skip(config, certificates, shutdown), fields(port = config.port), err)]
pub async fn serve_port(
  config: ServeConfig,
  certificates: &dyn CertificateBootstrap,
  shutdown: CancellationListener,
) -> Result<(), ServeError> {
  let tls_acceptor = match config.tls {
    TlsPolicy::Disabled => None,
    TlsPolicy::Required | TlsPolicy::Auto => {
      let paths = certificates.ensure_certificate(config.port)?;
      Some(tls::acceptor_from_pem(&paths)?)
    }
  };
  let addr = SocketAddr::new(config.bind_address, config.port);
  let listener = TcpListener::bind(addr)
    .await
    .map_err(|source| ServeError::Bind { addr, source })?;
  tracing::info!(
    %addr,
    tls = %config.tls,
    auth = %config.auth,
    fallback = %config.fallback_target,
    "Listening"
  );
  let dispatcher = Arc::new(Dispatcher::new(&config, tls_acceptor));
  dispatcher.serve(listener, shutdown).await;
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::{net::SocketAddr, sync::Arc, time::Duration};

  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
  };
  use tokio_util::sync::CancellationToken;

  use super::{serve_port, tls, Dispatcher, ServeError};
  use crate::{
    common::certificate::{CertificateBootstrap, SelfSignedCertificates},
    config::{ServeConfig, TlsPolicy},
  };

  /// Answers one connection: echoes whatever arrives, prefixed by `banner`
  async fn echo_target(banner: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      socket.write_all(banner).await.unwrap();
      let (mut reader, mut writer) = socket.split();
      tokio::io::copy(&mut reader, &mut writer).await.unwrap();
    });
    addr
  }

  fn plain_config(fallback: SocketAddr) -> ServeConfig {
    let mut config = ServeConfig::new(1);
    config.tls = TlsPolicy::Disabled;
    config.fallback_target = fallback.into();
    config.sniff_timeout = Duration::from_millis(500);
    config.dial_timeout = Duration::from_secs(2);
    config
  }

  #[tokio::test]
  async fn socks5_session_is_dispatched() {
    let target = echo_target(b"").await;
    let dispatcher = Dispatcher::new(&plain_config(target), None);
    let (mut client, server) = tokio::io::duplex(4096);
    let session = tokio::spawn(async move { dispatcher.handle_connection(server).await });

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&target.port().to_be_bytes());
    client.write_all(&request).await.unwrap();
    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply[1], 0x00);

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
    client.shutdown().await.unwrap();
    drop(client);
    let stats = session.await.unwrap().unwrap();
    assert_eq!(stats.a_to_b, 4);
  }

  #[tokio::test]
  async fn unrecognized_session_reaches_fallback_intact() {
    let fallback = echo_target(b"SSH-2.0-fallback\r\n").await;
    let dispatcher = Dispatcher::new(&plain_config(fallback), None);
    let (mut client, server) = tokio::io::duplex(4096);
    let session = tokio::spawn(async move { dispatcher.handle_connection(server).await });

    client.write_all(b"SSH-2.0-client\r\n").await.unwrap();
    let mut banner = [0u8; 18];
    client.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"SSH-2.0-fallback\r\n");
    let mut echoed = [0u8; 16];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"SSH-2.0-client\r\n");
    client.shutdown().await.unwrap();
    drop(client);
    session.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn auto_tls_serves_both_tls_and_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let paths = SelfSignedCertificates::new(dir.path())
      .ensure_certificate(8443)
      .unwrap();
    let acceptor = tls::acceptor_from_pem(&paths).unwrap();
    let target = echo_target(b"").await;
    let mut config = plain_config(target);
    config.tls = TlsPolicy::Auto;
    let dispatcher = Arc::new(Dispatcher::new(&config, Some(acceptor)));
    assert_eq!(dispatcher.tls_policy(), TlsPolicy::Auto);

    let mut roots = rustls::RootCertStore::empty();
    for cert in tls::load_certificates(&paths.cert).unwrap() {
      roots.add(&cert).unwrap();
    }
    let client_config = rustls::ClientConfig::builder()
      .with_safe_defaults()
      .with_root_certificates(roots)
      .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let (client, server) = tokio::io::duplex(16 * 1024);
    let session = {
      let dispatcher = Arc::clone(&dispatcher);
      tokio::spawn(async move { dispatcher.handle_connection(server).await })
    };
    let server_name = rustls::ServerName::try_from("localhost").unwrap();
    let mut client = connector.connect(server_name, client).await.unwrap();
    client
      .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", target).as_bytes())
      .await
      .unwrap();
    let mut status = vec![0u8; b"HTTP/1.1 200 Connection Established\r\n\r\n".len()];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(&status, b"HTTP/1.1 200 Connection Established\r\n\r\n");
    client.write_all(b"secret").await.unwrap();
    let mut echoed = [0u8; 6];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"secret");
    client.shutdown().await.unwrap();
    drop(client);
    session.await.unwrap().unwrap();

    // Plaintext still works under the same policy
    let plain_target = echo_target(b"").await;
    let (mut client, server) = tokio::io::duplex(4096);
    let session = tokio::spawn(async move { dispatcher.handle_connection(server).await });
    client
      .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", plain_target).as_bytes())
      .await
      .unwrap();
    let mut status = vec![0u8; b"HTTP/1.1 200 Connection Established\r\n\r\n".len()];
    client.read_exact(&mut status).await.unwrap();
    assert!(status.starts_with(b"HTTP/1.1 200"));
    client.shutdown().await.unwrap();
    drop(client);
    session.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn silent_client_under_auto_tls_reaches_fallback_within_one_sniff_window() {
    let dir = tempfile::tempdir().unwrap();
    let paths = SelfSignedCertificates::new(dir.path())
      .ensure_certificate(8445)
      .unwrap();
    let fallback = echo_target(b"SSH-2.0-fallback\r\n").await;
    let mut config = plain_config(fallback);
    config.tls = TlsPolicy::Auto;
    config.sniff_timeout = Duration::from_millis(300);
    config.handshake_timeout = Duration::from_secs(5);
    let dispatcher = Dispatcher::new(&config, Some(tls::acceptor_from_pem(&paths).unwrap()));
    let (mut client, server) = tokio::io::duplex(4096);
    let started = tokio::time::Instant::now();
    let session = tokio::spawn(async move { dispatcher.handle_connection(server).await });

    let mut banner = [0u8; 18];
    client.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"SSH-2.0-fallback\r\n");
    // The TLS peek and the sniff share a single window
    assert!(started.elapsed() < Duration::from_millis(900));

    client.shutdown().await.unwrap();
    drop(client);
    session.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn required_tls_rejects_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let paths = SelfSignedCertificates::new(dir.path())
      .ensure_certificate(8444)
      .unwrap();
    let mut config = plain_config("127.0.0.1:1".parse().unwrap());
    config.tls = TlsPolicy::Required;
    config.handshake_timeout = Duration::from_secs(1);
    let dispatcher = Dispatcher::new(&config, Some(tls::acceptor_from_pem(&paths).unwrap()));
    let (mut client, server) = tokio::io::duplex(4096);
    client
      .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
      .await
      .unwrap();
    assert!(dispatcher.handle_connection(server).await.is_err());
  }

  #[tokio::test]
  async fn occupied_port_is_a_bind_failure() {
    let occupant = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = ServeConfig::new(occupant.local_addr().unwrap().port());
    config.bind_address = "127.0.0.1".parse().unwrap();
    config.tls = TlsPolicy::Disabled;
    let dir = tempfile::tempdir().unwrap();
    let certificates = SelfSignedCertificates::new(dir.path());
    let err = serve_port(config, &certificates, CancellationToken::new().into())
      .await
      .unwrap_err();
    assert!(matches!(err, ServeError::Bind { .. }));
  }

  #[tokio::test]
  async fn listener_stops_on_shutdown_and_serves_until_then() {
    let dir = tempfile::tempdir().unwrap();
    let certificates = SelfSignedCertificates::new(dir.path());
    let target = echo_target(b"").await;

    // Find a free port, then release it for the worker
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let mut config = plain_config(target);
    config.port = port;
    config.bind_address = "127.0.0.1".parse().unwrap();
    config.tls = TlsPolicy::Auto;
    let shutdown = CancellationToken::new();
    let worker = {
      let listener = shutdown.clone().into();
      tokio::spawn(async move { serve_port(config, &certificates, listener).await })
    };

    let mut stream = loop {
      match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => break stream,
        Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
      }
    };
    stream
      .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", target).as_bytes())
      .await
      .unwrap();
    let mut status = [0u8; 12];
    stream.read_exact(&mut status).await.unwrap();
    assert_eq!(&status, b"HTTP/1.1 200");
    assert!(dir.path().join(format!("cert-{}.pem", port)).is_file());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), worker)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
  }
}
