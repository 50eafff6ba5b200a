// Copyright 2020 Joyent, Inc.

//! Server side of a NanoRPC connection.
//!
//! Each connection is served by one task that decodes requests in order and
//! hands REQUEST and SUBSCRIBE messages to a handler. PINGs are answered
//! here and hashed paths are resolved through the server's
//! [`PathHashRegistry`] before the handler sees them.
//!
//! A handler returns the responses to write right away, typically the
//! RESPONSE to a REQUEST or the first RESPONSE to a SUBSCRIBE. Updates for a
//! subscription may follow at any time later through the connection's
//! [`UpdateSink`], which a handler clones and keeps for as long as the
//! subscribed resource is worth watching.

use std::convert::TryFrom;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use prost::Message;
use slog::{debug, error, o, warn, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::client::default_logger;
use crate::error::Error;
use crate::hash::PathHashRegistry;
use crate::protocol::{
    decode_request, NanoRpcCodec, PathOneof, Request, RequestType, Response,
    ResponseStatus,
};

/// Responses queued by handlers before the connection task writes them.
const UPDATE_QUEUE: usize = 64;

/// Pushes responses onto one connection from outside of the handler call.
#[derive(Clone, Debug)]
pub struct UpdateSink {
    tx: mpsc::Sender<Response>,
}

impl UpdateSink {
    fn new(tx: mpsc::Sender<Response>) -> UpdateSink {
        UpdateSink { tx }
    }

    /// Queues `res` for writing, waiting while the queue is full. Fails with
    /// [`Error::SessionClosed`] once the connection is gone.
    pub async fn push(&self, res: Response) -> Result<(), Error> {
        self.tx.send(res).await.map_err(|_| Error::SessionClosed)
    }

    /// Queues an UPDATE for subscription `id` carrying `payload`.
    pub async fn update<M: Message>(
        &self,
        id: i32,
        payload: &M,
    ) -> Result<(), Error> {
        self.push(Response::update(id).with_payload(payload)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Serves one TCP connection until the peer goes away.
pub async fn make_task<F>(
    socket: TcpStream,
    handler: F,
    hashes: Arc<PathHashRegistry>,
    log: Option<&Logger>,
) where
    F: Fn(&Request, &UpdateSink, &Logger) -> Result<Vec<Response>, Error>,
{
    let remote_addr = socket
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| String::from("unknown"));
    serve(socket, remote_addr, handler, hashes, log).await
}

/// Serves one connection over any byte stream.
pub async fn serve<S, F>(
    io: S,
    remote_addr: String,
    handler: F,
    hashes: Arc<PathHashRegistry>,
    log: Option<&Logger>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&Request, &UpdateSink, &Logger) -> Result<Vec<Response>, Error>,
{
    let log = log.cloned().unwrap_or_else(default_logger).new(o!(
        "component" => "server",
        "remote_addr" => remote_addr
    ));
    let mut framed = Framed::new(io, NanoRpcCodec);
    let (tx, mut pushed) = mpsc::channel(UPDATE_QUEUE);
    let sink = UpdateSink::new(tx);

    debug!(log, "serving connection");

    loop {
        let responses = tokio::select! {
            frame = framed.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        error!(log, "failed to read request, dropping connection";
                               "err" => %e);
                        return;
                    }
                    None => break,
                };

                match decode_request(&frame) {
                    Ok((req, _)) => respond(&req, &handler, &hashes, &sink, &log),
                    Err(e) => {
                        warn!(log, "discarding undecodable request"; "err" => %e);
                        continue;
                    }
                }
            }
            Some(res) = pushed.recv() => vec![res],
        };

        for res in responses {
            if let Err(e) = framed.feed(res).await {
                error!(log, "failed to send response"; "err" => %e);
                return;
            }
        }

        if let Err(e) = SinkExt::<Response>::flush(&mut framed).await {
            error!(log, "failed to send response"; "err" => %e);
            return;
        }
    }

    debug!(log, "connection closed");
}

/// Builds the responses for one request.
pub fn respond<F>(
    req: &Request,
    handler: &F,
    hashes: &PathHashRegistry,
    sink: &UpdateSink,
    log: &Logger,
) -> Vec<Response>
where
    F: Fn(&Request, &UpdateSink, &Logger) -> Result<Vec<Response>, Error>,
{
    let id = req.request_id;

    match RequestType::try_from(req.request_type) {
        Ok(RequestType::Ping) => vec![Response::pong(id)],
        Ok(RequestType::Request) | Ok(RequestType::Subscribe) => {
            let resolved;
            let req = match &req.path_oneof {
                None => {
                    return vec![Response::reply(
                        id,
                        ResponseStatus::NotFound,
                        "missing path",
                    )]
                }
                Some(PathOneof::Path(_)) => req,
                Some(PathOneof::PathHash(hash)) => match hashes.resolve(*hash) {
                    Some(path) => {
                        let mut named = req.clone();
                        named.path_oneof = Some(PathOneof::Path(path));
                        resolved = named;
                        &resolved
                    }
                    None => {
                        return vec![Response::reply(
                            id,
                            ResponseStatus::NotFound,
                            format!("unknown path hash {:#010x}", hash),
                        )]
                    }
                },
            };

            match handler(req, sink, log) {
                Ok(responses) => responses,
                Err(Error::Response(e)) => {
                    let mut res = Response::reply(id, ResponseStatus::Ok, e.msg);
                    res.response_status = e.status;
                    vec![res]
                }
                Err(e) => {
                    warn!(log, "request handler failed";
                          "request_id" => id, "err" => %e);
                    vec![Response::reply(
                        id,
                        ResponseStatus::InternalError,
                        e.to_string(),
                    )]
                }
            }
        }
        _ => vec![Response::reply(
            id,
            ResponseStatus::Unspecified,
            "invalid request type",
        )],
    }
}
