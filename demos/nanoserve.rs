// Copyright 2020 Joyent, Inc.

use std::env;
use std::net::SocketAddr;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{debug, error, info, o, Drain, Logger};
use tokio::net::TcpListener;

use nanorpc::error::Error;
use nanorpc::protocol::{Request, Response, ResponseStatus};
use nanorpc::server::{self, UpdateSink};
use nanorpc::PathHashRegistry;

const COUNTER_UPDATES: u64 = 5;
const COUNTER_INTERVAL: Duration = Duration::from_secs(1);
const PATHS: &[&str] = &["/echo", "/counter"];

fn echo_handler(req: &Request, log: &Logger) -> Result<Vec<Response>, Error> {
    debug!(log, "handling echo request");
    let arg: String = req.payload()?;
    Ok(vec![Response::reply(req.request_id, ResponseStatus::Ok, "")
        .with_payload(&arg)])
}

/// Counts up once a second for a while after subscribing.
fn counter_handler(
    req: &Request,
    sink: &UpdateSink,
    log: &Logger,
) -> Result<Vec<Response>, Error> {
    debug!(log, "handling counter subscription");
    let id = req.request_id;
    let sink = sink.clone();
    let log = log.clone();
    tokio::spawn(async move {
        for n in 1..=COUNTER_UPDATES {
            tokio::time::sleep(COUNTER_INTERVAL).await;
            if let Err(e) = sink.update(id, &n).await {
                debug!(log, "counter subscriber went away"; "err" => %e);
                return;
            }
        }
    });
    Ok(vec![Response::reply(id, ResponseStatus::Ok, "")])
}

fn msg_handler(
    req: &Request,
    sink: &UpdateSink,
    log: &Logger,
) -> Result<Vec<Response>, Error> {
    match req.path() {
        Some("/echo") => echo_handler(req, log),
        Some("/counter") => counter_handler(req, sink, log),
        Some(path) => Err(Error::status(
            ResponseStatus::NotFound,
            format!("unsupported path: {}", path),
        )),
        None => Err(Error::status(ResponseStatus::NotFound, "missing path")),
    }
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:2030".to_string());
    let addr = addr.parse::<SocketAddr>().unwrap_or_else(|e| {
        eprintln!("Failed to parse listen address: {}", e);
        process::exit(1)
    });

    let listener = TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind {}: {}", addr, e);
        process::exit(1)
    });
    info!(root_log, "listening for nanorpc requests"; "address" => addr);

    let hashes = Arc::new(PathHashRegistry::new());
    for path in PATHS {
        match hashes.register(path) {
            Ok(hash) => info!(root_log, "registered path";
                              "path" => *path, "hash" => hash),
            Err(e) => error!(root_log, "failed to register path"; "err" => %e),
        }
    }

    loop {
        match listener.accept().await {
            Ok((socket, _)) => {
                let process_log = root_log.clone();
                let hashes = Arc::clone(&hashes);
                tokio::spawn(async move {
                    server::make_task(
                        socket,
                        msg_handler,
                        hashes,
                        Some(&process_log),
                    )
                    .await
                });
            }
            Err(e) => error!(root_log, "failed to accept socket"; "err" => %e),
        }
    }
}
