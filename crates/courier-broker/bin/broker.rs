use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    process::ExitCode,
    sync::{Arc, atomic::AtomicBool},
};

use clap::Parser;
use courier_broker::Broker;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Publish/subscribe broker relaying EOM-delimited messages over TCP.
#[derive(Debug, Parser)]
#[command(name = "courier-broker", version)]
struct Args {
    /// TCP port to listen on.
    #[arg(value_parser = clap::value_parser!(u16).range(1025..32000))]
    port: u16,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            error!(?err, signal, "failed to install signal handler");
            return ExitCode::FAILURE;
        }
    }

    let addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port));
    let mut broker = match Broker::bind(addr) {
        Ok(broker) => broker,
        Err(err) => {
            error!(%addr, ?err, "failed to start broker");
            return ExitCode::FAILURE;
        }
    };

    match broker.run(&shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(?err, "broker loop failed");
            ExitCode::FAILURE
        }
    }
}
