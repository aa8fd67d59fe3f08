// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Opening, closing, and inspecting background proxy instances
//!
//! Each instance is a detached worker process listening on its own port. The registry file is
//! the only record of them; it is read afresh for every operation.

use std::sync::Arc;

use serde::Serialize;

use crate::{
  common::registry::{FileRegistryStore, InstanceRecord, RegistryError},
  config::InstancePaths,
  util::logs::tail_lines,
};

mod launcher;
pub use launcher::{
  DetachedProcessLauncher, ProcessControl, ProcessLauncher, SignalError, UnixProcessControl,
  DEFAULT_TERMINATION_GRACE,
};
#[cfg(test)]
pub use launcher::{MockProcessControl, MockProcessLauncher};

/// Lines shown by the interactive log viewer
pub const DEFAULT_LOG_LINES: usize = 15;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
  #[error("Port {port} is already served by process {pid}")]
  PortInUse { port: u16, pid: u32 },
  #[error("No instance is registered on port {0}")]
  PortNotFound(u16),
  #[error("Port {0} cannot be served")]
  InvalidPort(u16),
  #[error("Worker process could not be launched")]
  Launch(#[source] std::io::Error),
  #[error("Instance log could not be read")]
  LogRead(#[source] std::io::Error),
  #[error(transparent)]
  Registry(#[from] RegistryError),
}

/// A registered instance along with whether its process still exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
  pub port: u16,
  pub pid: u32,
  pub running: bool,
}

pub struct InstanceSupervisor {
  registry: FileRegistryStore,
  launcher: Arc<dyn ProcessLauncher>,
  control: Arc<dyn ProcessControl>,
  paths: InstancePaths,
  worker_args: Vec<String>,
}

impl std::fmt::Debug for InstanceSupervisor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InstanceSupervisor")
      .field("registry", &self.registry)
      .field("paths", &self.paths)
      .field("worker_args", &self.worker_args)
      .finish_non_exhaustive()
  }
}

impl InstanceSupervisor {
  pub fn new(
    paths: InstancePaths,
    launcher: Arc<dyn ProcessLauncher>,
    control: Arc<dyn ProcessControl>,
  ) -> Self {
    Self {
      registry: FileRegistryStore::new(paths.state_file.clone()),
      launcher,
      control,
      paths,
      worker_args: Vec::new(),
    }
  }

  /// Extra arguments passed to every worker after the generated ones, such as `--tls required`
  pub fn with_worker_args<I, A>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = A>,
    A: Into<String>,
  {
    self.worker_args = args.into_iter().map(Into::into).collect();
    self
  }

  pub fn paths(&self) -> &InstancePaths {
    &self.paths
  }

  fn worker_command(&self, port: u16) -> Vec<String> {
    let mut args = vec![
      "serve".to_string(),
      "--port".to_string(),
      port.to_string(),
      "--state-dir".to_string(),
      self.paths.state_dir().display().to_string(),
      "--log-dir".to_string(),
      self.paths.log_dir.display().to_string(),
      "--cert-dir".to_string(),
      self.paths.cert_dir.display().to_string(),
    ];
    args.extend(self.worker_args.iter().cloned());
    args
  }

  /// Launches a worker for `port` and records it, returning the worker's pid
  ///
  /// An entry whose process has died is replaced; a live one is left alone.
  #[tracing::instrument(level = "debug", skip(self), err)]
  pub async fn open(&self, port: u16) -> Result<u32, SupervisorError> {
    if port == 0 {
      return Err(SupervisorError::InvalidPort(port));
    }
    let args = self.worker_command(port);
    let launcher = Arc::clone(&self.launcher);
    let control = Arc::clone(&self.control);
    let pid = self
      .registry
      .transaction(move |document| {
        if let Some(existing) = document.get(port).copied() {
          if control.is_alive(existing.pid) {
            return Err(SupervisorError::PortInUse {
              port,
              pid: existing.pid,
            });
          }
          tracing::warn!(port, pid = existing.pid, "Replacing stale instance entry");
        }
        let pid = launcher
          .launch_detached(&args)
          .map_err(SupervisorError::Launch)?;
        document.insert(InstanceRecord { port, pid });
        Ok(pid)
      })
      .await?;
    tracing::info!(port, pid, log = ?self.paths.log_file(port), "Instance opened");
    Ok(pid)
  }

  /// Forgets the worker on `port`, then stops it
  ///
  /// The entry is removed before signalling, and stays removed even when the worker could not
  /// be signalled, as it is then most likely already gone. The registry lock is released before
  /// the termination grace period starts.
  #[tracing::instrument(level = "debug", skip(self), err)]
  pub async fn close(&self, port: u16) -> Result<InstanceRecord, SupervisorError> {
    let record = self
      .registry
      .transaction::<_, SupervisorError, _>(move |document| {
        document
          .remove(port)
          .ok_or(SupervisorError::PortNotFound(port))
      })
      .await?;
    let control = Arc::clone(&self.control);
    let pid = record.pid;
    match tokio::task::spawn_blocking(move || control.terminate(pid)).await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => {
        tracing::warn!(port, pid, error = %e, "Could not signal instance process")
      }
      Err(e) => tracing::warn!(port, pid, error = %e, "Termination task failed"),
    }
    tracing::info!(port, pid, "Instance closed");
    Ok(record)
  }

  /// Every registered instance in port order; dead ones are reported, not removed
  pub async fn list(&self) -> Result<Vec<InstanceStatus>, SupervisorError> {
    let document = self.registry.snapshot().await?;
    Ok(
      document
        .records()
        .map(|record| InstanceStatus {
          port: record.port,
          pid: record.pid,
          running: self.control.is_alive(record.pid),
        })
        .collect(),
    )
  }

  /// The last `lines` non-empty lines logged by the instance on `port`
  ///
  /// `None` when that instance has not written a log yet.
  pub async fn logs(&self, port: u16, lines: usize) -> Result<Option<Vec<String>>, SupervisorError> {
    let path = self.paths.log_file(port);
    tokio::task::spawn_blocking(move || tail_lines(&path, lines))
      .await
      .map_err(|e| SupervisorError::LogRead(std::io::Error::new(std::io::ErrorKind::Other, e)))?
      .map_err(SupervisorError::LogRead)
  }
}

#[cfg(test)]
mod tests {
  use std::{io::Write, sync::Arc};

  use mockall::predicate::eq;

  use super::{
    InstanceStatus, InstanceSupervisor, MockProcessControl, MockProcessLauncher, SignalError,
    SupervisorError,
  };
  use crate::{common::registry::FileRegistryStore, config::InstancePaths};

  fn paths_in(dir: &std::path::Path) -> InstancePaths {
    InstancePaths {
      state_file: dir.join("state").join("ports.json"),
      log_dir: dir.join("logs"),
      cert_dir: dir.join("certs"),
    }
  }

  fn supervisor(
    dir: &std::path::Path,
    launcher: MockProcessLauncher,
    control: MockProcessControl,
  ) -> InstanceSupervisor {
    InstanceSupervisor::new(paths_in(dir), Arc::new(launcher), Arc::new(control))
  }

  #[tokio::test]
  async fn open_launches_worker_and_records_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut launcher = MockProcessLauncher::new();
    launcher
      .expect_launch_detached()
      .withf(|args| {
        args.len() >= 3 && args[0] == "serve" && args[1] == "--port" && args[2] == "8080"
          && args.ends_with(&["--tls".to_string(), "required".to_string()])
      })
      .times(1)
      .returning(|_| Ok(4242));
    let mut control = MockProcessControl::new();
    control.expect_is_alive().with(eq(4242)).returning(|_| true);
    let supervisor =
      supervisor(dir.path(), launcher, control).with_worker_args(["--tls", "required"]);

    assert_eq!(supervisor.open(8080).await.unwrap(), 4242);
    assert_eq!(
      supervisor.list().await.unwrap(),
      vec![InstanceStatus {
        port: 8080,
        pid: 4242,
        running: true
      }]
    );
  }

  #[tokio::test]
  async fn live_port_cannot_be_opened_twice() {
    let dir = tempfile::tempdir().unwrap();
    let mut launcher = MockProcessLauncher::new();
    launcher
      .expect_launch_detached()
      .times(1)
      .returning(|_| Ok(100));
    let mut control = MockProcessControl::new();
    control.expect_is_alive().returning(|_| true);
    let supervisor = supervisor(dir.path(), launcher, control);

    supervisor.open(9000).await.unwrap();
    let err = supervisor.open(9000).await.unwrap_err();
    assert!(matches!(
      err,
      SupervisorError::PortInUse {
        port: 9000,
        pid: 100
      }
    ));
    assert_eq!(supervisor.list().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn stale_entry_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let mut launcher = MockProcessLauncher::new();
    let mut pids = vec![1u32, 2].into_iter();
    launcher
      .expect_launch_detached()
      .times(2)
      .returning(move |_| Ok(pids.next().unwrap()));
    let mut control = MockProcessControl::new();
    control.expect_is_alive().with(eq(1)).returning(|_| false);
    control.expect_is_alive().with(eq(2)).returning(|_| true);
    let supervisor = supervisor(dir.path(), launcher, control);

    assert_eq!(supervisor.open(7000).await.unwrap(), 1);
    assert_eq!(supervisor.open(7000).await.unwrap(), 2);
    let listed = supervisor.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].pid, 2);
  }

  #[tokio::test]
  async fn failed_launch_records_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut launcher = MockProcessLauncher::new();
    launcher
      .expect_launch_detached()
      .returning(|_| Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing")));
    let supervisor = supervisor(dir.path(), launcher, MockProcessControl::new());
    assert!(matches!(
      supervisor.open(8081).await,
      Err(SupervisorError::Launch(_))
    ));
    assert!(supervisor.list().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn port_zero_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(
      dir.path(),
      MockProcessLauncher::new(),
      MockProcessControl::new(),
    );
    assert!(matches!(
      supervisor.open(0).await,
      Err(SupervisorError::InvalidPort(0))
    ));
  }

  #[tokio::test]
  async fn close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut launcher = MockProcessLauncher::new();
    launcher.expect_launch_detached().returning(|_| Ok(31));
    let mut control = MockProcessControl::new();
    control
      .expect_terminate()
      .with(eq(31))
      .times(1)
      .returning(|_| Ok(()));
    let supervisor = supervisor(dir.path(), launcher, control);

    supervisor.open(6000).await.unwrap();
    let closed = supervisor.close(6000).await.unwrap();
    assert_eq!(closed.pid, 31);
    assert!(matches!(
      supervisor.close(6000).await,
      Err(SupervisorError::PortNotFound(6000))
    ));
    assert!(supervisor.list().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn close_unknown_port_leaves_registry_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(
      dir.path(),
      MockProcessLauncher::new(),
      MockProcessControl::new(),
    );
    assert!(matches!(
      supervisor.close(1234).await,
      Err(SupervisorError::PortNotFound(1234))
    ));
    assert!(!supervisor.paths().state_file.exists());
  }

  #[tokio::test]
  async fn close_releases_registry_before_terminating() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = paths_in(dir.path()).state_file;
    let mut launcher = MockProcessLauncher::new();
    launcher.expect_launch_detached().returning(|_| Ok(77));
    let mut control = MockProcessControl::new();
    control
      .expect_terminate()
      .with(eq(77))
      .times(1)
      .returning(move |_| {
        // Another registry user must get through while the worker is being stopped
        let observer = FileRegistryStore::new(state_file.clone());
        let document = tokio::runtime::Handle::current()
          .block_on(observer.snapshot())
          .unwrap();
        assert!(document.get(6002).is_none());
        Ok(())
      });
    let supervisor = supervisor(dir.path(), launcher, control);
    supervisor.open(6002).await.unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), supervisor.close(6002))
      .await
      .expect("close must not deadlock on the registry lock")
      .unwrap();
  }

  #[tokio::test]
  async fn close_forgets_instance_even_when_signal_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut launcher = MockProcessLauncher::new();
    launcher.expect_launch_detached().returning(|_| Ok(55));
    let mut control = MockProcessControl::new();
    control.expect_terminate().returning(|pid| {
      Err(SignalError::Delivery {
        pid,
        source: std::io::Error::from_raw_os_error(3),
      })
    });
    let supervisor = supervisor(dir.path(), launcher, control);
    supervisor.open(6001).await.unwrap();
    supervisor.close(6001).await.unwrap();
    assert!(supervisor.list().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn registry_survives_new_supervisor() {
    let dir = tempfile::tempdir().unwrap();
    {
      let mut launcher = MockProcessLauncher::new();
      launcher.expect_launch_detached().returning(|_| Ok(808));
      let first = supervisor(dir.path(), launcher, MockProcessControl::new());
      first.open(8088).await.unwrap();
    }
    let mut control = MockProcessControl::new();
    control.expect_is_alive().returning(|_| false);
    let second = supervisor(dir.path(), MockProcessLauncher::new(), control);
    assert_eq!(
      second.list().await.unwrap(),
      vec![InstanceStatus {
        port: 8088,
        pid: 808,
        running: false
      }]
    );
    // Listing never prunes dead entries
    assert_eq!(second.list().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn logs_read_the_instance_file() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(
      dir.path(),
      MockProcessLauncher::new(),
      MockProcessControl::new(),
    );
    assert_eq!(supervisor.logs(5000, 15).await.unwrap(), None);

    std::fs::create_dir_all(&supervisor.paths().log_dir).unwrap();
    let mut file = std::fs::File::create(supervisor.paths().log_file(5000)).unwrap();
    for i in 0..30 {
      writeln!(file, "event {}", i).unwrap();
    }
    drop(file);
    let lines = supervisor.logs(5000, 15).await.unwrap().unwrap();
    assert_eq!(lines.len(), 15);
    assert_eq!(lines[0], "event 15");
    assert_eq!(lines[14], "event 29");
  }
}
