// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Reading the tail of append-only per-instance log files

use std::{
  fs::{File, OpenOptions},
  io::{Read, Seek, SeekFrom},
  path::Path,
};

const TAIL_CHUNK: u64 = 8 * 1024;

/// Returns the last `count` non-empty lines of the file at `path`, oldest first.
///
/// `Ok(None)` means no log has been written yet. The file is read backwards in chunks, so
/// long-lived instance logs do not have to be loaded whole.
pub fn tail_lines(path: &Path, count: usize) -> std::io::Result<Option<Vec<String>>> {
  let mut file = match File::open(path) {
    Ok(file) => file,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(e),
  };
  if count == 0 {
    return Ok(Some(Vec::new()));
  }
  let length = file.metadata()?.len();
  let mut position = length;
  let mut collected: Vec<u8> = Vec::new();
  // One extra line is needed, as the earliest line in a chunk may be partial
  while position > 0 && non_empty_lines(&collected) <= count {
    let chunk = TAIL_CHUNK.min(position);
    position -= chunk;
    file.seek(SeekFrom::Start(position))?;
    let mut buffer = vec![0u8; chunk as usize];
    file.read_exact(&mut buffer)?;
    buffer.extend_from_slice(&collected);
    collected = buffer;
  }
  let text = String::from_utf8_lossy(&collected);
  let mut lines: Vec<String> = text
    .lines()
    .filter(|line| !line.trim().is_empty())
    .map(String::from)
    .collect();
  if lines.len() > count {
    lines.drain(..lines.len() - count);
  }
  Ok(Some(lines))
}

/// Opens an instance log for appending, creating it and its directory as needed
pub fn open_append(path: &Path) -> std::io::Result<File> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  OpenOptions::new().create(true).append(true).open(path)
}

fn non_empty_lines(bytes: &[u8]) -> usize {
  String::from_utf8_lossy(bytes)
    .lines()
    .filter(|line| !line.trim().is_empty())
    .count()
}
