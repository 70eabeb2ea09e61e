// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use patchbay::util::validators::{
  parse_raw_fd, parse_socketaddr, validate_raw_fd, validate_socketaddr,
};

mod server;
mod worker;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("serve")
        .about("Accept client connections and route them onto worker processes")
        .arg(
          Arg::new("bind")
            .long("bind")
            .short('b')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:4822")
            .takes_value(true),
        )
        .arg(
          Arg::new("worker-exe")
            .long("worker-exe")
            .short('w')
            .help("Worker host executable; defaults to this binary")
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("handoff")
            .long("handoff")
            .possible_values(["ancillary", "ancillary-pipes", "rendezvous"])
            .default_value("ancillary")
            .takes_value(true),
        )
        .arg(
          Arg::new("handshake-timeout")
            .long("handshake-timeout")
            .help("Seconds to wait for the \"select\" instruction")
            .default_value("15")
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("worker")
        .about("Host one worker session attached to a routing daemon")
        .arg(
          Arg::new("protocol")
            .long("protocol")
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("session-id")
            .long("session-id")
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("control-fd")
            .long("control-fd")
            .validator(validate_raw_fd)
            .default_value("3")
            .takes_value(true),
        )
        .arg(
          Arg::new("handoff")
            .long("handoff")
            .possible_values(["ancillary", "ancillary-pipes", "rendezvous"])
            .default_value("ancillary")
            .takes_value(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::debug!("{} exited successfully", mode),
  }
}

async fn serve_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  let worker_executable = match args.value_of("worker-exe") {
    Some(path) => std::path::PathBuf::from(path),
    None => std::env::current_exe()?,
  };
  Ok(server::ServerArgs {
    bind_addr: parse_socketaddr(args.value_of("bind").unwrap())?,
    worker_executable,
    handoff: args
      .value_of("handoff")
      .unwrap()
      .parse()
      .map_err(anyhow::Error::msg)?,
    handshake_timeout: std::time::Duration::from_secs(
      args.value_of("handshake-timeout").unwrap().parse::<u64>()?,
    ),
  })
}

async fn worker_arg_handling(args: &'_ ArgMatches) -> Result<worker::WorkerArgs> {
  Ok(worker::WorkerArgs {
    protocol: args.value_of("protocol").unwrap().to_owned(),
    session_id: args.value_of("session-id").unwrap().to_owned(),
    control_fd: parse_raw_fd(args.value_of("control-fd").unwrap())?,
    handoff: args
      .value_of("handoff")
      .unwrap()
      .parse()
      .map_err(anyhow::Error::msg)?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("serve", opts) => {
      let config = serve_arg_handling(opts).await?;
      tracing::info!("Running as server with config {:#?}", config);
      server::server_main(config).await
    }
    ("worker", opts) => {
      let config = worker_arg_handling(opts).await?;
      worker::worker_main(config).await
    }
    (_, _) => unreachable!(),
  }
}
