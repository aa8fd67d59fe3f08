// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Durable record of running proxy instances, keyed by listening port
use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

mod file;
pub use file::FileRegistryStore;

#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct InstanceRecord {
  pub port: u16,
  pub pid: u32,
}

/// On-disk shape: `{"instances": {"8080": {"port": 8080, "pid": 1234}}}`
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
  #[serde(default)]
  pub instances: BTreeMap<u16, InstanceRecord>,
}

impl RegistryDocument {
  pub fn get(&self, port: u16) -> Option<&InstanceRecord> {
    self.instances.get(&port)
  }

  /// Records an instance, returning whatever previously held its port
  pub fn insert(&mut self, record: InstanceRecord) -> Option<InstanceRecord> {
    self.instances.insert(record.port, record)
  }

  pub fn remove(&mut self, port: u16) -> Option<InstanceRecord> {
    self.instances.remove(&port)
  }

  /// Records in ascending port order
  pub fn records(&self) -> impl Iterator<Item = &InstanceRecord> {
    self.instances.values()
  }

  pub fn len(&self) -> usize {
    self.instances.len()
  }

  pub fn is_empty(&self) -> bool {
    self.instances.is_empty()
  }
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
  #[error("Registry file {path:?} could not be accessed")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Registry could not be serialized")]
  Serialization(#[from] serde_json::Error),
  #[error("Registry lock {path:?} could not be acquired")]
  Lock {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}
