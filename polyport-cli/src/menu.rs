// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Interactive management loop over the instance supervisor

use crate::supervisor::{render_instances, render_logs};
use anyhow::Result;
use polyport::{
  supervisor::{InstanceSupervisor, DEFAULT_LOG_LINES},
  util::{log_buffer::LogBuffer, validators::parse_port},
};
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

const MENU: &str = "\
1) Open port
2) Close port
3) Show logs
4) List instances
5) Exit";

pub async fn menu_main(supervisor: &InstanceSupervisor, log_buffer: LogBuffer) -> Result<()> {
  run_menu(
    supervisor,
    &log_buffer,
    BufReader::new(tokio::io::stdin()),
    &mut std::io::stdout(),
  )
  .await
}

/// Runs until option 5 is chosen or input ends
///
/// Failed actions are reported and the loop continues. Log lines emitted while an action ran
/// are shown right after it.
pub async fn run_menu<R, W>(
  supervisor: &InstanceSupervisor,
  log_buffer: &LogBuffer,
  input: R,
  out: &mut W,
) -> Result<()>
where
  R: AsyncBufRead + Unpin,
  W: Write,
{
  let mut lines = input.lines();
  loop {
    writeln!(out, "{}", MENU)?;
    write!(out, "Select an option: ")?;
    out.flush()?;
    let choice = match lines.next_line().await? {
      Some(line) => line,
      None => break,
    };
    match choice.trim() {
      "1" => {
        if let Some(port) = prompt_port(&mut lines, out).await? {
          match supervisor.open(port).await {
            Ok(pid) => writeln!(out, "Port {} opened (pid {})", port, pid)?,
            Err(e) => writeln!(out, "Could not open port {}: {:#}", port, anyhow::Error::from(e))?,
          }
        }
      }
      "2" => {
        if let Some(port) = prompt_port(&mut lines, out).await? {
          match supervisor.close(port).await {
            Ok(record) => writeln!(out, "Port {} closed (pid {})", port, record.pid)?,
            Err(e) => writeln!(out, "Could not close port {}: {:#}", port, anyhow::Error::from(e))?,
          }
        }
      }
      "3" => {
        if let Some(port) = prompt_port(&mut lines, out).await? {
          match supervisor.logs(port, DEFAULT_LOG_LINES).await {
            Ok(tail) => render_logs(supervisor, port, tail, out)?,
            Err(e) => writeln!(out, "Could not read logs of port {}: {:#}", port, anyhow::Error::from(e))?,
          }
        }
      }
      "4" => match supervisor.list().await {
        Ok(instances) => render_instances(&instances, out)?,
        Err(e) => writeln!(out, "Could not list instances: {:#}", anyhow::Error::from(e))?,
      },
      "5" => break,
      "" => {}
      other => writeln!(out, "Unknown option {:?}", other)?,
    }
    for line in log_buffer.drain() {
      writeln!(out, "  {}", line)?;
    }
    writeln!(out)?;
  }
  Ok(())
}

async fn prompt_port<R, W>(lines: &mut tokio::io::Lines<R>, out: &mut W) -> Result<Option<u16>>
where
  R: AsyncBufRead + Unpin,
  W: Write,
{
  write!(out, "Port: ")?;
  out.flush()?;
  let line = match lines.next_line().await? {
    Some(line) => line,
    None => return Ok(None),
  };
  match parse_port(&line) {
    Ok(port) => Ok(Some(port)),
    Err(e) => {
      writeln!(out, "{}", e)?;
      Ok(None)
    }
  }
}
