use std::{
    io::{self, BufRead, Write},
    process::ExitCode,
    sync::{Arc, Mutex},
    thread,
};

use clap::Parser;
use courier_client::{Client, Disconnector, Greeting};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Interactive client for the courier broker.
#[derive(Debug, Parser)]
#[command(name = "courier-client", version)]
struct Args {
    /// Broker host to connect to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

const HELP: &str = "\
courier-client - list of possible commands:
CONNECT <port> <client_name>    connect to a broker at the given port under the given name
DISCONNECT                      drop the session; all subscriptions are removed
PUBLISH <topic> <message>       publish a message to a topic
SUBSCRIBE <topic>               subscribe to a topic
UNSUBSCRIBE <topic>             remove a subscription
-h                              show this help";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    // Ctrl-C tears the session down cleanly instead of leaving the broker a
    // lost client to time out.
    let session: Arc<Mutex<Option<Disconnector>>> = Arc::new(Mutex::new(None));
    {
        let session = Arc::clone(&session);
        if let Err(err) = ctrlc::set_handler(move || {
            if let Ok(guard) = session.lock()
                && let Some(disconnector) = guard.as_ref()
            {
                disconnector.disconnect();
            }
            std::process::exit(0);
        }) {
            eprintln!("ERROR: failed to install Ctrl-C handler: {err}");
            return ExitCode::FAILURE;
        }
    }

    repl(&args.host, &session)
}

fn repl(host: &str, session: &Arc<Mutex<Option<Disconnector>>>) -> ExitCode {
    let stdin = io::stdin();
    let mut client: Option<Client> = None;

    loop {
        print!("Enter command or (-h): ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return ExitCode::SUCCESS,
            Ok(_) => {}
            Err(err) => {
                eprintln!("ERROR: failed to read input: {err}");
                return ExitCode::FAILURE;
            }
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }
        let (word, rest) = line.split_once(' ').map_or((line, ""), |(w, r)| (w, r));

        match word {
            "-h" | "-H" => println!("{HELP}"),
            "CONNECT" => {
                if client.is_some() {
                    println!("INFO: already connected, disconnect first");
                    continue;
                }
                client = do_connect(host, rest, session);
            }
            "DISCONNECT" => match client.take() {
                Some(active) => {
                    if let Ok(mut guard) = session.lock() {
                        guard.take();
                    }
                    match active.disconnect() {
                        Ok(()) => println!("INFO: disconnected"),
                        Err(err) => eprintln!("ERROR: disconnect failed: {err}"),
                    }
                }
                None => println!("INFO: not connected"),
            },
            "PUBLISH" => {
                let Some(active) = client.as_mut() else {
                    println!("INFO: not connected, only CONNECT is accepted");
                    continue;
                };
                let (topic, data) = rest.split_once(' ').map_or((rest, ""), |(t, d)| (t, d));
                if let Err(err) = active.publish(topic, data) {
                    eprintln!("ERROR: {err}");
                }
            }
            "SUBSCRIBE" | "UNSUBSCRIBE" => {
                let Some(active) = client.as_mut() else {
                    println!("INFO: not connected, only CONNECT is accepted");
                    continue;
                };
                let topic = rest.split(' ').next().unwrap_or("");
                let result = if word == "SUBSCRIBE" {
                    active.subscribe(topic)
                } else {
                    active.unsubscribe(topic)
                };
                if let Err(err) = result {
                    eprintln!("ERROR: {err}");
                }
            }
            _ => println!("ERROR: wrong command, to see help enter -h"),
        }
    }
}

fn do_connect(
    host: &str,
    rest: &str,
    session: &Arc<Mutex<Option<Disconnector>>>,
) -> Option<Client> {
    let Some((port, name)) = rest.split_once(' ') else {
        eprintln!("ERROR: usage: CONNECT <port> <client_name>");
        return None;
    };
    let Ok(port) = port.parse::<u16>() else {
        eprintln!("ERROR: port must be an integer in range 1024 < port < 65536");
        return None;
    };
    if port <= 1024 {
        eprintln!("ERROR: port must be an integer in range 1024 < port < 65536");
        return None;
    }

    let (mut client, greeting) = match Client::connect(host, port, name) {
        Ok(ok) => ok,
        Err(err) => {
            eprintln!("ERROR: {err}");
            return None;
        }
    };
    match &greeting {
        Greeting::Accepted => println!("INFO: connection established"),
        Greeting::Restored { topics } => {
            println!("INFO: connection restored, subscriptions: {}", topics.join(" "));
        }
    }

    match client.disconnector() {
        Ok(disconnector) => {
            if let Ok(mut guard) = session.lock() {
                *guard = Some(disconnector);
            }
        }
        Err(err) => debug!(?err, "no disconnector handle"),
    }

    // Deliveries print from their own thread while the prompt stays
    // responsive.
    match client.incoming() {
        Ok(mut incoming) => {
            thread::spawn(move || {
                loop {
                    match incoming.recv() {
                        Ok(delivery) => println!("{} {}", delivery.topic, delivery.data),
                        Err(err) => {
                            debug!(?err, "delivery stream ended");
                            break;
                        }
                    }
                }
            });
        }
        Err(err) => eprintln!("ERROR: cannot listen for deliveries: {err}"),
    }

    Some(client)
}
