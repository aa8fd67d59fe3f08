// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use polyport::{
  config::{AuthPolicy, InstancePaths, ServeConfig, TlsPolicy},
  util::{
    self,
    log_buffer::LogBuffer,
    validators::{
      parse_ipaddr, parse_port, parse_seconds, parse_target, validate_ipaddr, validate_port,
      validate_seconds, validate_target,
    },
  },
};
use std::path::PathBuf;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

mod certgen;
mod menu;
mod server;
mod supervisor;

fn app() -> Command<'static> {
  Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      Arg::new("state-dir")
        .long("state-dir")
        .help("Directory holding the instance registry [env: POLYPORT_STATE_DIR]")
        .takes_value(true)
        .global(true),
    )
    .arg(
      Arg::new("log-dir")
        .long("log-dir")
        .help("Directory for per-instance log files [env: POLYPORT_LOG_DIR]")
        .takes_value(true)
        .global(true),
    )
    .arg(
      Arg::new("cert-dir")
        .long("cert-dir")
        .help("Directory for per-instance certificates [env: POLYPORT_CERT_DIR]")
        .takes_value(true)
        .global(true),
    )
    .subcommand(
      Command::new("serve")
        .about("Run a proxy listener in the foreground; this is what `open` launches")
        .arg(port_arg().long("port").short('p'))
        .arg(
          Arg::new("bind")
            .long("bind")
            .short('i')
            .validator(validate_ipaddr)
            .default_value("0.0.0.0")
            .takes_value(true),
        )
        .args(worker_policy_args())
        .arg(
          Arg::new("ssh-host")
            .long("ssh-host")
            .help("Host probed by `--auth ssh`")
            .default_value("localhost")
            .takes_value(true),
        )
        .arg(timeout_arg("handshake-timeout", "5"))
        .arg(timeout_arg("sniff-timeout", "5"))
        .arg(timeout_arg("dial-timeout", "10")),
    )
    .subcommand(
      Command::new("open")
        .about("Start a detached proxy instance on a port")
        .arg(port_arg())
        .args(worker_policy_args()),
    )
    .subcommand(
      Command::new("close")
        .about("Stop the proxy instance on a port")
        .arg(port_arg()),
    )
    .subcommand(Command::new("list").about("Show registered proxy instances"))
    .subcommand(
      Command::new("logs")
        .about("Show the latest log lines of a proxy instance")
        .arg(port_arg())
        .arg(
          Arg::new("lines")
            .long("lines")
            .short('n')
            .validator(|v| v.parse::<usize>().map(|_| ()).map_err(|e| e.to_string()))
            .default_value("15")
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate (or reuse) the self-signed certificate for a port")
        .arg(port_arg())
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand(Command::new("menu").about("Manage proxy instances interactively"))
    .subcommand_required(true)
    .arg_required_else_help(true)
}

fn main() {
  let matches = app().get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>").to_string();
  let paths = instance_paths(&matches);
  let log_buffer = init_logging(&matches, &paths);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(main_args_handler(&matches, paths, log_buffer)) {
    Err(err) => {
      tracing::error!(mode = %mode, err = ?err, "dispatch_command_failure");
      eprintln!("Error: {:#}", err);
      std::process::exit(1);
    }
    Ok(_) => tracing::debug!("{} exited successfully", mode),
  }
}

fn port_arg() -> Arg<'static> {
  Arg::new("port")
    .help("TCP port of the instance, 1-65535")
    .validator(validate_port)
    .takes_value(true)
    .required(true)
}

fn timeout_arg(name: &'static str, default: &'static str) -> Arg<'static> {
  Arg::new(name)
    .long(name)
    .help("Seconds")
    .validator(validate_seconds)
    .default_value(default)
    .takes_value(true)
}

/// Settings shared by `serve` and `open`, the latter forwarding them to its worker
fn worker_policy_args() -> Vec<Arg<'static>> {
  vec![
    Arg::new("tls")
      .long("tls")
      .possible_values(TlsPolicy::NAMES.iter().copied())
      .default_value("auto")
      .takes_value(true),
    Arg::new("auth")
      .long("auth")
      .possible_values(AuthPolicy::NAMES.iter().copied())
      .default_value("none")
      .takes_value(true),
    Arg::new("fallback-target")
      .long("fallback-target")
      .help("Destination for WebSocket and unrecognized sessions")
      .validator(validate_target)
      .default_value("127.0.0.1:22")
      .takes_value(true),
  ]
}

/// Environment defaults, then command-line overrides
fn instance_paths(matches: &ArgMatches) -> InstancePaths {
  let sub = matches.subcommand().map(|(_, sub)| sub);
  let lookup = |name: &str| {
    sub
      .and_then(|sub| sub.value_of(name))
      .or_else(|| matches.value_of(name))
      .map(PathBuf::from)
  };
  let mut paths = InstancePaths::from_env();
  if let Some(dir) = lookup("state-dir") {
    paths = paths.with_state_dir(dir);
  }
  if let Some(dir) = lookup("log-dir") {
    paths.log_dir = dir;
  }
  if let Some(dir) = lookup("cert-dir") {
    paths.cert_dir = dir;
  }
  paths
}

/// Workers log to their instance file, the menu to an in-memory buffer, anything else to stderr
fn init_logging(matches: &ArgMatches, paths: &InstancePaths) -> Option<LogBuffer> {
  let default_directive = match matches.subcommand_name() {
    Some("menu") => "warn",
    _ => "info",
  };
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
  let mut log_buffer = None;
  let (writer, ansi) = match matches.subcommand() {
    Some(("serve", opts)) => {
      let port = opts
        .value_of("port")
        .and_then(|p| parse_port(p).ok())
        .unwrap_or_default();
      match util::logs::open_append(&paths.log_file(port)) {
        Ok(file) => (BoxMakeWriter::new(std::sync::Mutex::new(file)), false),
        Err(e) => {
          eprintln!("Log file unavailable, logging to stderr: {}", e);
          (BoxMakeWriter::new(std::io::stderr), false)
        }
      }
    }
    Some(("menu", _)) => {
      let buffer = LogBuffer::default();
      log_buffer = Some(buffer.clone());
      (BoxMakeWriter::new(buffer), false)
    }
    _ => (BoxMakeWriter::new(std::io::stderr), true),
  };
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(writer)
    .with_ansi(ansi)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  log_buffer
}

pub fn server_arg_handling(args: &'_ ArgMatches, paths: &InstancePaths) -> Result<server::ServerArgs> {
  let port = parse_port(args.value_of("port").context("Port is required")?)?;
  let mut config = ServeConfig::new(port);
  config.bind_address = parse_ipaddr(args.value_of("bind").unwrap_or("0.0.0.0"))?;
  config.tls = args.value_of_t("tls")?;
  config.auth = args.value_of_t("auth")?;
  config.ssh_host = args.value_of("ssh-host").unwrap_or("localhost").to_string();
  config.fallback_target = parse_target(args.value_of("fallback-target").unwrap_or("127.0.0.1:22"))?;
  config.handshake_timeout = parse_seconds(args.value_of("handshake-timeout").unwrap_or("5"))?;
  config.sniff_timeout = parse_seconds(args.value_of("sniff-timeout").unwrap_or("5"))?;
  config.dial_timeout = parse_seconds(args.value_of("dial-timeout").unwrap_or("10"))?;
  Ok(server::ServerArgs {
    config,
    cert_dir: paths.cert_dir.clone(),
  })
}

/// `open` settings forwarded verbatim to the launched worker
fn worker_args(args: &'_ ArgMatches) -> Vec<String> {
  ["tls", "auth", "fallback-target"]
    .iter()
    .filter_map(|name| {
      args
        .value_of(name)
        .map(|value| vec![format!("--{}", name), value.to_string()])
    })
    .flatten()
    .collect()
}

async fn main_args_handler(
  matches: &'_ ArgMatches,
  paths: InstancePaths,
  log_buffer: Option<LogBuffer>,
) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("serve", opts) => {
      let args = server_arg_handling(opts, &paths)?;
      tracing::info!("Running as server with config {:#?}", args);
      server::server_main(args).await
    }
    ("open", opts) => {
      let port = parse_port(opts.value_of("port").context("Port is required")?)?;
      let supervisor = supervisor::build(paths)?.with_worker_args(worker_args(opts));
      supervisor::open_main(&supervisor, port).await
    }
    ("close", opts) => {
      let port = parse_port(opts.value_of("port").context("Port is required")?)?;
      supervisor::close_main(&supervisor::build(paths)?, port).await
    }
    ("list", _) => supervisor::list_main(&supervisor::build(paths)?).await,
    ("logs", opts) => {
      let port = parse_port(opts.value_of("port").context("Port is required")?)?;
      let lines = opts.value_of_t::<usize>("lines")?;
      supervisor::logs_main(&supervisor::build(paths)?, port, lines).await
    }
    ("cert", opts) => {
      let port = parse_port(opts.value_of("port").context("Port is required")?)?;
      let san = opts.value_of("san").unwrap_or("localhost");
      certgen::certgen_main(paths.cert_dir, port, san.into()).await
    }
    ("menu", _) => {
      let supervisor = supervisor::build(paths)?;
      menu::menu_main(&supervisor, log_buffer.unwrap_or_default()).await
    }
    (_, _) => unreachable!(),
  }
}

#[cfg(test)]
mod tests {
  use super::{app, instance_paths, server_arg_handling, worker_args};
  use polyport::config::{AuthPolicy, TlsPolicy};
  use std::path::PathBuf;

  #[test]
  fn open_forwards_worker_policies() {
    let matches = app()
      .try_get_matches_from(["polyport", "open", "8080", "--tls", "required"])
      .unwrap();
    let (_, opts) = matches.subcommand().unwrap();
    assert_eq!(
      worker_args(opts),
      vec![
        "--tls",
        "required",
        "--auth",
        "none",
        "--fallback-target",
        "127.0.0.1:22"
      ]
    );
  }

  #[test]
  fn directory_flags_override_defaults() {
    let matches = app()
      .try_get_matches_from([
        "polyport",
        "list",
        "--state-dir",
        "/srv/polyport",
        "--log-dir",
        "/srv/logs",
      ])
      .unwrap();
    let paths = instance_paths(&matches);
    assert_eq!(paths.state_file, PathBuf::from("/srv/polyport/ports.json"));
    assert_eq!(paths.log_dir, PathBuf::from("/srv/logs"));
  }

  #[test]
  fn serve_arguments_build_config() {
    let matches = app()
      .try_get_matches_from([
        "polyport",
        "serve",
        "--port",
        "1080",
        "--tls",
        "disabled",
        "--auth",
        "ssh",
        "--dial-timeout",
        "3",
        "--cert-dir",
        "/srv/certs",
      ])
      .unwrap();
    let (_, opts) = matches.subcommand().unwrap();
    let paths = instance_paths(&matches);
    let args = server_arg_handling(opts, &paths).unwrap();
    assert_eq!(args.config.port, 1080);
    assert_eq!(args.config.tls, TlsPolicy::Disabled);
    assert_eq!(args.config.auth, AuthPolicy::Ssh);
    assert_eq!(args.config.dial_timeout, std::time::Duration::from_secs(3));
    assert_eq!(args.cert_dir, PathBuf::from("/srv/certs"));
  }

  #[test]
  fn port_zero_is_refused() {
    assert!(app()
      .try_get_matches_from(["polyport", "close", "0"])
      .is_err());
  }
}
