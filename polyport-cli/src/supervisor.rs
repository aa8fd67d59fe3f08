// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use polyport::{
  config::InstancePaths,
  supervisor::{DetachedProcessLauncher, InstanceStatus, InstanceSupervisor, UnixProcessControl},
};
use std::{io::Write, sync::Arc};

/// A supervisor that relaunches this executable as its workers
pub fn build(paths: InstancePaths) -> Result<InstanceSupervisor> {
  let launcher =
    DetachedProcessLauncher::current_exe().context("Could not locate the polyport executable")?;
  Ok(InstanceSupervisor::new(
    paths,
    Arc::new(launcher),
    Arc::new(UnixProcessControl::default()),
  ))
}

pub fn render_instances(instances: &[InstanceStatus], out: &mut impl Write) -> std::io::Result<()> {
  if instances.is_empty() {
    return writeln!(out, "No instances registered");
  }
  writeln!(out, "{:<7} {:<9} STATUS", "PORT", "PID")?;
  for instance in instances {
    let status = if instance.running { "running" } else { "dead" };
    writeln!(out, "{:<7} {:<9} {}", instance.port, instance.pid, status)?;
  }
  Ok(())
}

pub fn render_logs(
  supervisor: &InstanceSupervisor,
  port: u16,
  lines: Option<Vec<String>>,
  out: &mut impl Write,
) -> std::io::Result<()> {
  match lines {
    None => writeln!(
      out,
      "No log for port {} yet (expected at {})",
      port,
      supervisor.paths().log_file(port).display()
    ),
    Some(lines) if lines.is_empty() => writeln!(out, "Log for port {} is empty", port),
    Some(lines) => lines.iter().try_for_each(|line| writeln!(out, "{}", line)),
  }
}

pub async fn open_main(supervisor: &InstanceSupervisor, port: u16) -> Result<()> {
  let pid = supervisor.open(port).await?;
  println!(
    "Port {} opened (pid {}), logging to {}",
    port,
    pid,
    supervisor.paths().log_file(port).display()
  );
  Ok(())
}

pub async fn close_main(supervisor: &InstanceSupervisor, port: u16) -> Result<()> {
  let record = supervisor.close(port).await?;
  println!("Port {} closed (pid {})", record.port, record.pid);
  Ok(())
}

pub async fn list_main(supervisor: &InstanceSupervisor) -> Result<()> {
  let instances = supervisor.list().await?;
  render_instances(&instances, &mut std::io::stdout().lock())?;
  Ok(())
}

pub async fn logs_main(supervisor: &InstanceSupervisor, port: u16, lines: usize) -> Result<()> {
  let tail = supervisor.logs(port, lines).await?;
  render_logs(supervisor, port, tail, &mut std::io::stdout().lock())?;
  Ok(())
}
