// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use futures::StreamExt;
use slog::{debug, info, o, Drain, Level, LevelFilter, Logger};
use tokio::net::TcpListener;
use tokio_test::block_on;

use nanorpc::error::{is_not_found, response_as_error, Error};
use nanorpc::protocol::{Request, Response, ResponseStatus, ResponseType};
use nanorpc::server::{self, UpdateSink};
use nanorpc::{Client, PathHashRegistry, SessionConfig};

const SENSOR_PATH: &str = "/sensors/temp";

fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn echo_handler(
    req: &Request,
    log: &Logger,
) -> Result<Vec<Response>, Error> {
    debug!(log, "handling echo request");
    let arg: String = req.payload()?;
    let res = Response::reply(req.request_id, ResponseStatus::Ok, "")
        .with_payload(&arg);
    Ok(vec![res])
}

fn sensor_handler(
    req: &Request,
    sink: &UpdateSink,
    log: &Logger,
) -> Result<Vec<Response>, Error> {
    debug!(log, "handling sensor subscription");
    let id = req.request_id;
    let sink = sink.clone();
    tokio::spawn(async move {
        for reading in &[21u32, 22, 23] {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if sink.update(id, reading).await.is_err() {
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
        Some(SENSOR_PATH) => sensor_handler(req, sink, log),
        _ => Err(Error::status(ResponseStatus::NotFound, "unknown sensor")),
    }
}

#[tokio::main]
async fn run_server(ready: Sender<SocketAddr>) {
    let root_log = test_logger();
    let hashes = Arc::new(PathHashRegistry::new());
    hashes.register("/echo").expect("hash collision");
    hashes.register(SENSOR_PATH).expect("hash collision");

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("no local address");
    info!(root_log, "listening for nanorpc requests"; "address" => addr);

    ready.send(addr).expect("test went away");

    while let Ok((stream, _)) = listener.accept().await {
        let process_log = root_log.clone();
        let hashes = Arc::clone(&hashes);
        tokio::spawn(async move {
            server::make_task(stream, msg_handler, hashes, Some(&process_log))
                .await;
        });
    }
}

async fn run_client(addr: SocketAddr) -> Result<(), Box<dyn StdError>> {
    let log = test_logger();
    let config =
        SessionConfig::default().with_request_timeout(Duration::from_secs(5));
    let client = Client::new(config, Some(&log));
    let session = client.connect(&addr).await?;

    session.ping().await?;
    session.keepalive().await?;

    for i in 1..50 {
        let data_size = i * 1000;
        let arg = "a".repeat(data_size);
        let req = Request::request(0, "/echo").with_payload(&arg);
        let res = session.call(req).await?;
        let echoed: String = res.payload()?;
        assert_eq!(echoed.len(), data_size);
    }

    let err = session
        .call(Request::request(0, "/sensors/humidity"))
        .await
        .unwrap_err();
    assert!(is_not_found(&err));
    assert_eq!(err.to_string(), "nanorpc: not found: unknown sensor");

    let mut updates = session.subscribe(Request::subscribe(42, SENSOR_PATH)).await?;

    let first = updates.next().await.expect("subscription ended early");
    assert_eq!(first.response_type(), ResponseType::Response);
    response_as_error(Some(&first))?;

    let mut readings = Vec::new();
    for _ in 0..3 {
        let update = updates.next().await.expect("subscription ended early");
        assert_eq!(update.request_id, 42);
        assert_eq!(update.response_type(), ResponseType::Update);
        readings.push(update.payload::<u32>()?);
    }
    assert_eq!(readings, vec![21, 22, 23]);
    assert_eq!(session.pending_ids(), vec![42]);
    updates.unsubscribe();

    let hash = client.hashes().register("/echo")?;
    let req = Request::request(0, hash).with_payload(&String::from("hashed"));
    let res = session.call(req).await?;
    assert_eq!(res.payload::<String>()?, "hashed");

    let unknown = client.hashes().register("/sensors/humidity")?;
    let err = session.call(Request::request(0, unknown)).await.unwrap_err();
    assert!(is_not_found(&err));

    session.close().await;
    assert!(session.is_closed());
    assert!(session.ping().await.is_err());

    Ok(())
}

#[test]
fn client_server_comms() {
    let (ready_tx, ready_rx) = channel();
    let _h_server = thread::spawn(move || run_server(ready_tx));

    let addr = ready_rx.recv().expect("server failed to start");
    let result = block_on(run_client(addr));
    assert!(result.is_ok(), "{:?}", result.err());
}
