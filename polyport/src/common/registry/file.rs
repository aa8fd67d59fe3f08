// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  fs::File,
  io::Write,
  path::{Path, PathBuf},
  sync::Arc,
};

use super::{RegistryDocument, RegistryError};

/// A registry persisted as a JSON document on disk
///
/// Every operation loads the file afresh. Read-modify-write sequences are serialized within the
/// process by an async mutex, and across processes by an exclusive `flock` on a sibling lock
/// file, so no caller ever observes a partially written registry.
#[derive(Debug, Clone)]
pub struct FileRegistryStore {
  state_file: PathBuf,
  lock_file: PathBuf,
  serial: Arc<tokio::sync::Mutex<()>>,
}

impl FileRegistryStore {
  pub fn new(state_file: impl Into<PathBuf>) -> Self {
    let state_file = state_file.into();
    let lock_file = sibling_with_suffix(&state_file, ".lock");
    Self {
      state_file,
      lock_file,
      serial: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  pub fn state_file(&self) -> &Path {
    &self.state_file
  }

  /// Runs `mutate` against the current registry contents under both locks
  ///
  /// The document is written back only when `mutate` succeeds and changed it.
  pub async fn transaction<T, E, F>(&self, mutate: F) -> Result<T, E>
  where
    T: Send + 'static,
    E: From<RegistryError> + Send + 'static,
    F: FnOnce(&mut RegistryDocument) -> Result<T, E> + Send + 'static,
  {
    let _serial = self.serial.lock().await;
    let state_file = self.state_file.clone();
    let lock_file = self.lock_file.clone();
    let blocking = tokio::task::spawn_blocking(move || -> Result<T, E> {
      let _lock = FileLock::exclusive(&lock_file)?;
      let mut document = load(&state_file)?;
      let original = document.clone();
      let outcome = mutate(&mut document)?;
      if document != original {
        save(&state_file, &document)?;
        tracing::trace!(instances = document.len(), "Registry persisted");
      }
      Ok(outcome)
    });
    match blocking.await {
      Ok(result) => result,
      Err(join_error) => Err(E::from(RegistryError::Io {
        path: self.state_file.clone(),
        source: std::io::Error::new(std::io::ErrorKind::Other, join_error.to_string()),
      })),
    }
  }

  /// A consistent copy of the registry as it is on disk now
  pub async fn snapshot(&self) -> Result<RegistryDocument, RegistryError> {
    self
      .transaction(|document| Ok::<_, RegistryError>(document.clone()))
      .await
  }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
  let mut name = path
    .file_name()
    .map(|name| name.to_os_string())
    .unwrap_or_default();
  name.push(suffix);
  path.with_file_name(name)
}

fn load(path: &Path) -> Result<RegistryDocument, RegistryError> {
  let raw = match std::fs::read_to_string(path) {
    Ok(raw) => raw,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RegistryDocument::default()),
    Err(source) => {
      return Err(RegistryError::Io {
        path: path.to_path_buf(),
        source,
      })
    }
  };
  if raw.trim().is_empty() {
    return Ok(RegistryDocument::default());
  }
  match serde_json::from_str::<RegistryDocument>(&raw) {
    Ok(document) => Ok(document),
    Err(e) => {
      tracing::warn!(path = ?path, error = %e, "Registry file is corrupt; treating it as empty");
      Ok(RegistryDocument::default())
    }
  }
}

/// Replaces the registry file atomically: temporary file, fsync, rename
fn save(path: &Path, document: &RegistryDocument) -> Result<(), RegistryError> {
  let io_error = |source: std::io::Error| RegistryError::Io {
    path: path.to_path_buf(),
    source,
  };
  if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
    std::fs::create_dir_all(parent).map_err(io_error)?;
  }
  let serialized = serde_json::to_vec_pretty(document)?;
  let temporary = sibling_with_suffix(path, ".tmp");
  let mut file = File::create(&temporary).map_err(io_error)?;
  file.write_all(&serialized).map_err(io_error)?;
  file.sync_all().map_err(io_error)?;
  drop(file);
  std::fs::rename(&temporary, path).map_err(io_error)
}

/// Holds an exclusive advisory lock until dropped
struct FileLock {
  #[allow(dead_code)]
  file: File,
}

impl FileLock {
  fn exclusive(path: &Path) -> Result<Self, RegistryError> {
    let lock_error = |source: std::io::Error| RegistryError::Lock {
      path: path.to_path_buf(),
      source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(lock_error)?;
    }
    let file = std::fs::OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .open(path)
      .map_err(lock_error)?;
    Self::acquire(&file).map_err(lock_error)?;
    Ok(Self { file })
  }

  #[cfg(unix)]
  fn acquire(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    loop {
      // Safety: the descriptor stays open for the lifetime of `file`
      let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
      if result == 0 {
        return Ok(());
      }
      let error = std::io::Error::last_os_error();
      if error.kind() != std::io::ErrorKind::Interrupted {
        return Err(error);
      }
    }
  }

  #[cfg(not(unix))]
  fn acquire(_file: &File) -> std::io::Result<()> {
    Ok(())
  }
}

#[cfg(unix)]
impl Drop for FileLock {
  fn drop(&mut self) {
    use std::os::unix::io::AsRawFd;
    // Closing the descriptor would also release it; unlocking first keeps the order explicit
    unsafe {
      libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
    }
  }
}
