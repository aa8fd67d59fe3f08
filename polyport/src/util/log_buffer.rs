// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  collections::VecDeque,
  io::Write,
  sync::{Arc, Mutex},
};

pub const DEFAULT_LOG_BUFFER_CAPACITY: usize = 100;

/// A bounded, ordered record of recent log lines; the oldest line is evicted first.
///
/// Usable directly as a `tracing_subscriber` writer, so a process can keep its diagnostics in
/// memory instead of (or alongside) a log file.
#[derive(Clone, Debug)]
pub struct LogBuffer {
  lines: Arc<Mutex<VecDeque<String>>>,
  capacity: usize,
}

impl Default for LogBuffer {
  fn default() -> Self {
    Self::with_capacity(DEFAULT_LOG_BUFFER_CAPACITY)
  }
}

impl LogBuffer {
  pub fn with_capacity(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self {
      lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
      capacity,
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn push(&self, line: impl Into<String>) {
    let mut lines = self.lines.lock().expect("Log buffer lock poisoned");
    while lines.len() >= self.capacity {
      lines.pop_front();
    }
    lines.push_back(line.into());
  }

  pub fn len(&self) -> usize {
    self.lines.lock().expect("Log buffer lock poisoned").len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// The most recent `count` lines, oldest first
  pub fn last(&self, count: usize) -> Vec<String> {
    let lines = self.lines.lock().expect("Log buffer lock poisoned");
    let skip = lines.len().saturating_sub(count);
    lines.iter().skip(skip).cloned().collect()
  }

  /// Removes and returns every buffered line, oldest first
  pub fn drain(&self) -> Vec<String> {
    self
      .lines
      .lock()
      .expect("Log buffer lock poisoned")
      .drain(..)
      .collect()
  }
}

/// Collects one formatted event, splitting it into lines when the writer is dropped
pub struct LogBufferWriter {
  buffer: LogBuffer,
  pending: Vec<u8>,
}

impl LogBufferWriter {
  fn commit(&mut self) {
    if self.pending.is_empty() {
      return;
    }
    let text = String::from_utf8_lossy(&self.pending).into_owned();
    self.pending.clear();
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
      self.buffer.push(line);
    }
  }
}

impl Write for LogBufferWriter {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.pending.extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> std::io::Result<()> {
    self.commit();
    Ok(())
  }
}

impl Drop for LogBufferWriter {
  fn drop(&mut self) {
    self.commit();
  }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
  type Writer = LogBufferWriter;

  fn make_writer(&'a self) -> Self::Writer {
    LogBufferWriter {
      buffer: self.clone(),
      pending: Vec::new(),
    }
  }
}
