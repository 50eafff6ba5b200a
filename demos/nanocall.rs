// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use futures::StreamExt;

use nanorpc::error::{response_as_error, Error};
use nanorpc::protocol::{PathOneof, Request, Response, ResponseType};
use nanorpc::{Client, SessionConfig};

static APP: &str = "nanocall";
static DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;
const DEFAULT_TIMEOUT_MS: u64 = 5000;

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making a NanoRPC call")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("path")
                .help("Path of the remote resource")
                .long("path")
                .short("P")
                .takes_value(true)
                .required_unless("ping"),
        )
        .arg(
            Arg::with_name("data")
                .help("String argument sent with the request")
                .long("data")
                .short("d")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("subscribe")
                .help("Subscribe to the path and print updates")
                .long("subscribe")
                .short("s")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("hash")
                .help("Send the path as its 32-bit hash")
                .long("hash")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("ping")
                .help("Only measure the round trip to the server")
                .long("ping")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Milliseconds to wait for a reply (Default: 5000)")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .get_matches()
}

fn print_response(res: &Response) {
    match res.payload::<String>() {
        Ok(text) if !text.is_empty() => println!("{}", text),
        _ => println!("{:?}", res),
    }
}

async fn run(matches: &ArgMatches<'_>, addr: SocketAddr) -> Result<(), Error> {
    let timeout = value_t!(matches, "timeout", u64).unwrap_or(DEFAULT_TIMEOUT_MS);
    let config = SessionConfig::default()
        .with_request_timeout(Duration::from_millis(timeout));
    let client = Client::new(config, None);
    let session = client.connect(&addr).await?;

    if matches.is_present("ping") {
        let rtt = session.ping().await?;
        println!("pong in {:?}", rtt);
        session.close().await;
        return Ok(());
    }

    let path = matches.value_of("path").unwrap_or("/");
    let path = if matches.is_present("hash") {
        PathOneof::PathHash(client.hashes().register(path)?)
    } else {
        PathOneof::from(path)
    };
    let data = matches.value_of("data").map(String::from);

    if matches.is_present("subscribe") {
        let mut req = Request::subscribe(0, path);
        if let Some(data) = data {
            req.set_payload(&data);
        }
        let mut updates = session.subscribe(req).await?;
        while let Some(res) = updates.next().await {
            if res.response_type() == ResponseType::Response {
                response_as_error(Some(&res))?;
                continue;
            }
            print_response(&res);
        }
    } else {
        let mut req = Request::request(0, path);
        if let Some(data) = data {
            req.set_payload(&data);
        }
        let res = session.call(req).await?;
        print_response(&res);
    }

    session.close().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });

    if let Err(e) = run(&matches, addr).await {
        eprintln!("Error: {}", e);
        process::exit(1)
    }
}
