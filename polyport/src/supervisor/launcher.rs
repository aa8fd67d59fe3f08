// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  path::PathBuf,
  process::{Command, Stdio},
  time::{Duration, Instant},
};

/// Starts worker processes that outlive the caller
#[cfg_attr(test, mockall::automock)]
pub trait ProcessLauncher: Send + Sync {
  /// Spawns a detached worker with the given arguments, returning its process id
  fn launch_detached(&self, args: &[String]) -> std::io::Result<u32>;
}

#[derive(thiserror::Error, Debug)]
pub enum SignalError {
  #[error("{0} is not a valid process id")]
  InvalidPid(u32),
  #[error("Signal could not be delivered to process {pid}")]
  Delivery {
    pid: u32,
    #[source]
    source: std::io::Error,
  },
}

/// Observes and stops worker processes by pid
#[cfg_attr(test, mockall::automock)]
pub trait ProcessControl: Send + Sync {
  fn is_alive(&self, pid: u32) -> bool;
  fn terminate(&self, pid: u32) -> Result<(), SignalError>;
}

/// Re-executes a program (normally this one) in a new session with no standard streams
#[derive(Debug, Clone)]
pub struct DetachedProcessLauncher {
  program: PathBuf,
}

impl DetachedProcessLauncher {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
    }
  }

  pub fn current_exe() -> std::io::Result<Self> {
    Ok(Self::new(std::env::current_exe()?))
  }
}

impl ProcessLauncher for DetachedProcessLauncher {
  fn launch_detached(&self, args: &[String]) -> std::io::Result<u32> {
    let mut command = Command::new(&self.program);
    command
      .args(args)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null());
    #[cfg(unix)]
    {
      use std::os::unix::process::CommandExt;
      // SAFETY: setsid is async-signal-safe and touches no memory of the parent
      unsafe {
        command.pre_exec(|| {
          if libc::setsid() == -1 {
            return Err(std::io::Error::last_os_error());
          }
          Ok(())
        });
      }
    }
    let child = command.spawn()?;
    let pid = child.id();
    tracing::debug!(pid, program = ?self.program, ?args, "Launched detached worker");
    Ok(pid)
  }
}

pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(2);
const TERMINATION_POLL: Duration = Duration::from_millis(50);

/// Signals processes through `kill(2)`: SIGTERM, then SIGKILL once the grace period lapses
#[derive(Debug, Clone)]
pub struct UnixProcessControl {
  grace: Duration,
}

impl Default for UnixProcessControl {
  fn default() -> Self {
    Self::with_grace(DEFAULT_TERMINATION_GRACE)
  }
}

impl UnixProcessControl {
  pub fn with_grace(grace: Duration) -> Self {
    Self { grace }
  }
}

#[cfg(unix)]
fn to_pid(pid: u32) -> Result<libc::pid_t, SignalError> {
  match libc::pid_t::try_from(pid) {
    Ok(raw) if raw > 0 => Ok(raw),
    _ => Err(SignalError::InvalidPid(pid)),
  }
}

#[cfg(unix)]
fn send_signal(pid: libc::pid_t, signal: libc::c_int) -> std::io::Result<()> {
  // SAFETY: kill has no memory-safety preconditions
  if unsafe { libc::kill(pid, signal) } == 0 {
    Ok(())
  } else {
    Err(std::io::Error::last_os_error())
  }
}

/// Collects the exit status of a finished child of this process, if it is one
#[cfg(unix)]
fn reap(pid: libc::pid_t) {
  let mut status = 0;
  // SAFETY: status points to a live local
  unsafe {
    libc::waitpid(pid, &mut status, libc::WNOHANG);
  }
}

#[cfg(unix)]
impl ProcessControl for UnixProcessControl {
  fn is_alive(&self, pid: u32) -> bool {
    let pid = match to_pid(pid) {
      Ok(pid) => pid,
      Err(_) => return false,
    };
    // Workers launched by this process linger as zombies until reaped
    reap(pid);
    match send_signal(pid, 0) {
      Ok(()) => true,
      Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
  }

  fn terminate(&self, pid: u32) -> Result<(), SignalError> {
    let raw = to_pid(pid)?;
    send_signal(raw, libc::SIGTERM).map_err(|source| SignalError::Delivery { pid, source })?;
    let deadline = Instant::now() + self.grace;
    while Instant::now() < deadline {
      if !self.is_alive(pid) {
        return Ok(());
      }
      std::thread::sleep(TERMINATION_POLL);
    }
    tracing::warn!(pid, grace = ?self.grace, "Worker ignored SIGTERM; sending SIGKILL");
    match send_signal(raw, libc::SIGKILL) {
      Ok(()) => {
        reap(raw);
        Ok(())
      }
      Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
      Err(source) => Err(SignalError::Delivery { pid, source }),
    }
  }
}

#[cfg(all(test, unix))]
mod tests {
  use std::time::Duration;

  use super::{ProcessControl, SignalError, UnixProcessControl};

  #[test]
  fn terminates_a_running_child() {
    let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();
    let control = UnixProcessControl::with_grace(Duration::from_secs(2));
    assert!(control.is_alive(pid));
    control.terminate(pid).unwrap();
    assert!(!control.is_alive(pid));
  }

  #[test]
  fn invalid_pids_are_rejected() {
    let control = UnixProcessControl::default();
    assert!(!control.is_alive(0));
    assert!(matches!(control.terminate(0), Err(SignalError::InvalidPid(0))));
    assert!(matches!(
      control.terminate(u32::MAX),
      Err(SignalError::InvalidPid(_))
    ));
  }

  #[test]
  fn exited_process_is_not_alive() {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    let control = UnixProcessControl::default();
    assert!(!control.is_alive(pid));
    assert!(matches!(
      control.terminate(pid),
      Err(SignalError::Delivery { .. })
    ));
  }
}
