// Copyright 2020 Joyent, Inc.

//! Client side of a NanoRPC connection.
//!
//! A [`Session`] owns one connection. Callers send requests through it
//! concurrently while a reader task decodes every incoming frame and routes
//! it, by request id, to whoever is waiting for it:
//!
//! * a REQUEST (or a PING carrying an id) gets a [`PendingReply`] resolved by
//!   the first matching RESPONSE or PONG;
//! * a SUBSCRIBE gets a [`Subscription`], a stream fed by every matching
//!   UPDATE until the caller drops it or the session closes;
//! * a PING with id 0 is a keepalive and nothing waits for its PONG.
//!
//! When the connection ends, [`Session::close`] is called, or the last
//! `Session` clone is dropped, every pending reply resolves with
//! [`Error::SessionClosed`] and every subscription stream ends.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::{SinkExt, Stream, StreamExt};
use slog::{debug, error, info, o, trace, warn, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::SessionConfig;
use crate::error::{response_as_error, Error};
use crate::hash::PathHashRegistry;
use crate::protocol::{
    decode_response, NanoRpcCodec, Request, RequestType, Response,
    ResponseType, REQUEST_ID_MAX,
};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Writer = FramedWrite<BoxedWriter, NanoRpcCodec>;
type ReplyResult = Result<Response, Error>;

/// How long `close` waits for the write half before giving up on a clean
/// shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn default_logger() -> Logger {
    Logger::root(slog_stdlog::StdLog.fuse(), o!())
}

/// Creates sessions sharing one configuration, logger and path-hash
/// registry.
pub struct Client {
    config: SessionConfig,
    log: Logger,
    hashes: Arc<PathHashRegistry>,
}

impl Client {
    pub fn new(config: SessionConfig, log: Option<&Logger>) -> Client {
        Client {
            config,
            log: log.cloned().unwrap_or_else(default_logger),
            hashes: Arc::new(PathHashRegistry::new()),
        }
    }

    pub fn hashes(&self) -> &Arc<PathHashRegistry> {
        &self.hashes
    }

    pub async fn connect(&self, addr: &SocketAddr) -> Result<Session, Error> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            warn!(self.log, "failed to connect"; "remote_addr" => %addr, "err" => %e);
            e
        })?;
        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr()?.to_string();

        Ok(self.session(stream, remote_addr))
    }

    /// Starts a session over an already established connection. Must be
    /// called from within a tokio runtime.
    pub fn session<T>(&self, io: T, remote_addr: impl Into<String>) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Session::with_registry(
            io,
            remote_addr,
            self.config.clone(),
            Some(&self.log),
            Arc::clone(&self.hashes),
        )
    }
}

enum Waiter {
    Reply(oneshot::Sender<ReplyResult>),
    Updates(mpsc::Sender<Response>, Arc<AtomicBool>),
    /// Nobody waits any more, but replies are still owed for this id.
    Abandoned,
}

struct Entry {
    token: u64,
    waiter: Waiter,
    // replies owed to abandoned requests that used this id before
    stale: u32,
}

/// What the reader should do with an incoming response once the table lock
/// is released.
enum Delivery {
    Reply(oneshot::Sender<ReplyResult>),
    Update {
        tx: mpsc::Sender<Response>,
        token: u64,
        overflowed: Arc<AtomicBool>,
    },
    Unmatched(&'static str),
}

struct PendingTable {
    entries: HashMap<i32, Entry>,
    closed: bool,
    next_id: i32,
    // distinguishes an entry from a later one that reuses its id
    next_token: u64,
}

impl PendingTable {
    fn new() -> PendingTable {
        PendingTable {
            entries: HashMap::new(),
            closed: false,
            next_id: 1,
            next_token: 0,
        }
    }

    fn allocate_id(&mut self) -> i32 {
        loop {
            let id = self.next_id;
            self.next_id = if id >= REQUEST_ID_MAX { 1 } else { id + 1 };
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert(&mut self, id: i32, waiter: Waiter) -> Result<u64, Error> {
        if self.closed {
            return Err(Error::SessionClosed);
        }

        let stale = match self.entries.get(&id) {
            None => 0,
            Some(Entry {
                waiter: Waiter::Abandoned,
                stale,
                ..
            }) => *stale,
            Some(_) => return Err(Error::DuplicateRequestId(id)),
        };

        let token = self.next_token;
        self.next_token += 1;
        self.entries.insert(
            id,
            Entry {
                token,
                waiter,
                stale,
            },
        );
        Ok(token)
    }

    /// Stops waiting on the entry `token` names. A one-shot entry leaves a
    /// tombstone behind so its late reply isn't taken for the answer to a
    /// later request with the same id.
    fn abandon(&mut self, id: i32, token: u64) -> bool {
        let entry = match self.entries.get_mut(&id) {
            Some(entry) if entry.token == token => entry,
            _ => return false,
        };

        match entry.waiter {
            Waiter::Abandoned => return false,
            Waiter::Reply(_) => entry.stale += 1,
            Waiter::Updates(..) => (),
        }

        if entry.stale == 0 {
            self.entries.remove(&id);
        } else {
            entry.waiter = Waiter::Abandoned;
        }
        true
    }

    fn is_waiting(entry: &Entry) -> bool {
        match entry.waiter {
            Waiter::Abandoned => false,
            _ => true,
        }
    }

    fn route(&mut self, res: &Response) -> Delivery {
        let id = res.request_id;
        let response_type = res.response_type();
        let answers_request = response_type == ResponseType::Response
            || response_type == ResponseType::Pong;

        let entry = match self.entries.get_mut(&id) {
            Some(entry) => entry,
            None => return Delivery::Unmatched("no pending request"),
        };

        // replies for an id arrive in the order its requests were sent
        if answers_request && entry.stale > 0 {
            entry.stale -= 1;
            if entry.stale == 0 && !PendingTable::is_waiting(entry) {
                self.entries.remove(&id);
            }
            return Delivery::Unmatched("reply to an abandoned request");
        }

        match (response_type, &entry.waiter) {
            (ResponseType::Update, Waiter::Updates(tx, overflowed))
            | (ResponseType::Response, Waiter::Updates(tx, overflowed)) => {
                let delivery = Delivery::Update {
                    tx: tx.clone(),
                    token: entry.token,
                    overflowed: Arc::clone(overflowed),
                };
                // a failed RESPONSE to a SUBSCRIBE rejects the subscription
                if response_type == ResponseType::Response && !res.is_ok() {
                    self.entries.remove(&id);
                }
                delivery
            }
            (ResponseType::Response, Waiter::Reply(_))
            | (ResponseType::Pong, Waiter::Reply(_)) => {
                match self.entries.remove(&id).map(|e| e.waiter) {
                    Some(Waiter::Reply(tx)) => Delivery::Reply(tx),
                    _ => Delivery::Unmatched("no pending request"),
                }
            }
            _ => Delivery::Unmatched("unexpected response type"),
        }
    }
}

struct Shared {
    log: Logger,
    remote_addr: String,
    config: SessionConfig,
    hashes: Arc<PathHashRegistry>,
    pending: Mutex<PendingTable>,
    // None once the session has let go of the connection
    writer: tokio::sync::Mutex<Option<Writer>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/*
 * Nothing panics while holding these locks and every update is applied in
 * full, so a poisoned lock still guards consistent state.
 */
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        lock(&self.pending)
    }

    fn forget(&self, id: i32, token: u64) {
        if self.pending().abandon(id, token) {
            trace!(self.log, "request abandoned"; "request_id" => id);
        }
    }

    fn dispatch(&self, res: Response) {
        let id = res.request_id;
        let response_type = res.response_type();

        if id == 0 && response_type == ResponseType::Pong {
            trace!(self.log, "keepalive acknowledged");
            return;
        }

        let delivery = self.pending().route(&res);

        match delivery {
            Delivery::Reply(tx) => {
                if tx.send(Ok(res)).is_err() {
                    debug!(self.log, "waiter went away, discarding reply";
                           "request_id" => id);
                }
            }
            Delivery::Update {
                tx,
                token,
                overflowed,
            } => match tx.try_send(res) {
                Ok(()) => (),
                Err(TrySendError::Full(_)) => {
                    warn!(self.log, "subscriber fell behind, ending subscription";
                          "request_id" => id,
                          "update_buffer" => self.config.update_buffer);
                    overflowed.store(true, Ordering::Release);
                    self.pending().abandon(id, token);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(self.log, "subscriber went away, discarding update";
                           "request_id" => id);
                }
            },
            Delivery::Unmatched(why) => {
                debug!(self.log, "discarding unmatched response";
                       "request_id" => id,
                       "response_type" => response_type.as_str_name(),
                       "reason" => why);
            }
        }
    }

    /// Marks the session closed and releases everything waiting on it.
    /// Returns false when it was already closed.
    fn teardown(&self, reason: &'static str) -> bool {
        let entries: Vec<Entry> = {
            let mut table = self.pending();
            if table.closed {
                return false;
            }
            table.closed = true;
            table.entries.drain().map(|(_, entry)| entry).collect()
        };

        info!(self.log, "session closed";
              "reason" => reason, "pending" => entries.len());

        for entry in entries {
            match entry.waiter {
                Waiter::Reply(tx) => {
                    let _ = tx.send(Err(Error::SessionClosed));
                }
                // dropping the sender ends the stream
                Waiter::Updates(..) | Waiter::Abandoned => (),
            }
        }

        if let Some(handle) = lock(&self.reader).take() {
            handle.abort();
        }

        true
    }
}

/// Shared by every `Session` clone. The last clone dropped closes the
/// connection.
struct Owner(Arc<Shared>);

impl Drop for Owner {
    fn drop(&mut self) {
        if !self.0.teardown("session dropped") {
            return;
        }

        // a writer stuck mid-send keeps the connection until it finishes
        if let Ok(mut writer) = self.0.writer.try_lock() {
            writer.take();
        }
    }
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, NanoRpcCodec);

    let reason = loop {
        match frames.next().await {
            Some(Ok(frame)) => match decode_response(&frame) {
                Ok((res, _)) => shared.dispatch(res),
                Err(e) => {
                    warn!(shared.log, "discarding undecodable response";
                          "err" => %e);
                }
            },
            Some(Err(e)) => {
                error!(shared.log, "failed to read response"; "err" => %e);
                break "read error";
            }
            None => break "connection closed by peer",
        }
    };

    shared.teardown(reason);
}

/// How the caller follows up on a request it sent.
pub enum Correlation {
    Reply(PendingReply),
    Updates(Subscription),
    /// A keepalive ping; nothing is waiting for its pong.
    Keepalive,
}

/// The eventual reply to one request. Dropping it abandons the request, and
/// a reply arriving later is discarded.
pub struct PendingReply {
    id: i32,
    token: u64,
    rx: oneshot::Receiver<ReplyResult>,
    shared: Arc<Shared>,
}

impl PendingReply {
    pub fn id(&self) -> i32 {
        self.id
    }

    pub async fn wait(mut self) -> Result<Response, Error> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(Error::NoResponse),
        }
    }

    /// Like [`wait`](Self::wait), but gives up with [`Error::NoResponse`]
    /// once `timeout` has passed.
    pub async fn wait_timeout(self, limit: Duration) -> Result<Response, Error> {
        match timeout(limit, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(Error::NoResponse),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.shared.forget(self.id, self.token);
    }
}

/// Updates pushed for one SUBSCRIBE request, in the order the server sent
/// them. Dropping it unsubscribes.
///
/// At most `SessionConfig::update_buffer` updates are held for a subscriber.
/// One that falls further behind has its stream ended and
/// [`overflowed`](Self::overflowed) set.
pub struct Subscription {
    id: i32,
    token: u64,
    rx: mpsc::Receiver<Response>,
    overflowed: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl Subscription {
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Returns `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Response> {
        self.rx.recv().await
    }

    /// True when the stream was ended because its buffer filled up.
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Stops routing updates to this subscription. The server isn't told;
    /// whatever it still sends for this id is discarded.
    pub fn unsubscribe(self) {
        self.shared.forget(self.id, self.token);
    }
}

impl Stream for Subscription {
    type Item = Response;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Response>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.forget(self.id, self.token);
    }
}

/// One NanoRPC connection.
///
/// Cloning is cheap and every clone refers to the same connection. Dropping
/// the last clone closes it.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    _owner: Arc<Owner>,
}

impl Session {
    /// Starts a session over `io`, spawning its reader task. Must be called
    /// from within a tokio runtime.
    pub fn new<T>(
        io: T,
        remote_addr: impl Into<String>,
        config: SessionConfig,
        log: Option<&Logger>,
    ) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let hashes = Arc::new(PathHashRegistry::new());
        Session::with_registry(io, remote_addr, config, log, hashes)
    }

    fn with_registry<T>(
        io: T,
        remote_addr: impl Into<String>,
        config: SessionConfig,
        log: Option<&Logger>,
        hashes: Arc<PathHashRegistry>,
    ) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let remote_addr = remote_addr.into();
        let log = log.cloned().unwrap_or_else(default_logger).new(o!(
            "component" => "session",
            "remote_addr" => remote_addr.clone()
        ));

        let (reader, writer) = tokio::io::split(io);
        let writer: BoxedWriter = Box::new(writer);

        let shared = Arc::new(Shared {
            log,
            remote_addr,
            config,
            hashes,
            pending: Mutex::new(PendingTable::new()),
            writer: tokio::sync::Mutex::new(Some(FramedWrite::new(
                writer,
                NanoRpcCodec,
            ))),
            reader: Mutex::new(None),
        });

        let handle = tokio::spawn(read_loop(Arc::clone(&shared), reader));
        *lock(&shared.reader) = Some(handle);

        debug!(shared.log, "session established");

        Session {
            _owner: Arc::new(Owner(Arc::clone(&shared))),
            shared,
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.shared.remote_addr
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn hashes(&self) -> &Arc<PathHashRegistry> {
        &self.shared.hashes
    }

    pub fn is_closed(&self) -> bool {
        self.shared.pending().closed
    }

    /// Ids of the requests and subscriptions still waiting, sorted.
    pub fn pending_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .shared
            .pending()
            .entries
            .iter()
            .filter(|(_, entry)| PendingTable::is_waiting(entry))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// An id not currently in flight. It isn't reserved, so a concurrent
    /// [`send`](Self::send) may still claim it first.
    pub fn next_request_id(&self) -> Result<i32, Error> {
        let mut table = self.shared.pending();
        if table.closed {
            return Err(Error::SessionClosed);
        }
        Ok(table.allocate_id())
    }

    /// Sends a request and registers whatever will wait for its answer.
    ///
    /// REQUEST and SUBSCRIBE must name a path. When their id is 0 the session
    /// assigns one. A PING with id 0 is sent as a keepalive. Reusing an id
    /// that is still in flight fails with [`Error::DuplicateRequestId`].
    ///
    /// A failed write closes the session.
    pub async fn send(&self, req: Request) -> Result<Correlation, Error> {
        let assign_id =
            req.request_id == 0 && req.request_type() != RequestType::Ping;
        self.start(req, assign_id).await
    }

    async fn start(
        &self,
        mut req: Request,
        assign_id: bool,
    ) -> Result<Correlation, Error> {
        let request_type = validate(&req)?;

        let correlation = {
            let mut table = self.shared.pending();
            if table.closed {
                return Err(Error::SessionClosed);
            }
            if assign_id {
                req.request_id = table.allocate_id();
            }

            let id = req.request_id;
            match request_type {
                RequestType::Ping if id == 0 => Correlation::Keepalive,
                RequestType::Subscribe => {
                    let (tx, rx) =
                        mpsc::channel(self.shared.config.update_buffer.max(1));
                    let overflowed = Arc::new(AtomicBool::new(false));
                    let token = table.insert(
                        id,
                        Waiter::Updates(tx, Arc::clone(&overflowed)),
                    )?;
                    Correlation::Updates(Subscription {
                        id,
                        token,
                        rx,
                        overflowed,
                        shared: Arc::clone(&self.shared),
                    })
                }
                _ => {
                    let (tx, rx) = oneshot::channel();
                    let token = table.insert(id, Waiter::Reply(tx))?;
                    Correlation::Reply(PendingReply {
                        id,
                        token,
                        rx,
                        shared: Arc::clone(&self.shared),
                    })
                }
            }
        };

        let id = req.request_id;
        trace!(self.shared.log, "sending request";
               "request_id" => id,
               "request_type" => request_type.as_str_name());

        if let Err(e) = self.write(req).await {
            error!(self.shared.log, "failed to send request";
                   "request_id" => id, "err" => %e);
            // the frame may be half written, the stream can't be trusted
            self.shared.teardown("write error");
            drop(correlation);
            return Err(e);
        }

        Ok(correlation)
    }

    async fn write(&self, req: Request) -> Result<(), Error> {
        let mut writer = self.shared.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.send(req).await,
            None => Err(Error::SessionClosed),
        }
    }

    /// Sends a REQUEST and waits for its reply, honouring the configured
    /// request timeout. A non-OK status is returned as an error.
    pub async fn call(&self, req: Request) -> Result<Response, Error> {
        if req.request_type() != RequestType::Request {
            return Err(Error::InvalidRequest("call expects a REQUEST"));
        }

        let reply = match self.send(req).await? {
            Correlation::Reply(reply) => reply,
            _ => return Err(Error::InvalidRequest("call expects a REQUEST")),
        };

        let res = match self.shared.config.request_timeout {
            Some(limit) => reply.wait_timeout(limit).await?,
            None => reply.wait().await?,
        };

        response_as_error(Some(&res))?;
        Ok(res)
    }

    pub async fn subscribe(&self, req: Request) -> Result<Subscription, Error> {
        if req.request_type() != RequestType::Subscribe {
            return Err(Error::InvalidRequest("subscribe expects a SUBSCRIBE"));
        }

        match self.send(req).await? {
            Correlation::Updates(subscription) => Ok(subscription),
            _ => Err(Error::InvalidRequest("subscribe expects a SUBSCRIBE")),
        }
    }

    /// Sends a PING with a fresh id and waits for its PONG, returning the
    /// round trip time.
    pub async fn ping(&self) -> Result<Duration, Error> {
        let started = Instant::now();

        let reply = match self.start(Request::ping(0), true).await? {
            Correlation::Reply(reply) => reply,
            _ => return Err(Error::NoResponse),
        };

        match self.shared.config.request_timeout {
            Some(limit) => reply.wait_timeout(limit).await?,
            None => reply.wait().await?,
        };

        Ok(started.elapsed())
    }

    /// Sends a PING nobody waits on.
    pub async fn keepalive(&self) -> Result<(), Error> {
        self.start(Request::ping(0), false).await.map(|_| ())
    }

    /// Closes the session. Pending replies resolve with
    /// [`Error::SessionClosed`], subscriptions end and later sends fail.
    /// Closing twice is harmless.
    ///
    /// The write half is shut down unless another sender holds it for
    /// longer than a second.
    pub async fn close(&self) {
        if !self.shared.teardown("closed by caller") {
            return;
        }

        let mut writer =
            match timeout(SHUTDOWN_TIMEOUT, self.shared.writer.lock()).await {
                Ok(writer) => writer,
                Err(_) => {
                    debug!(self.shared.log, "writer busy, skipping shutdown");
                    return;
                }
            };

        if let Some(mut framed) = writer.take() {
            match timeout(SHUTDOWN_TIMEOUT, framed.get_mut().shutdown()).await {
                Ok(Ok(())) => (),
                Ok(Err(e)) => {
                    debug!(self.shared.log, "failed to shut down connection";
                           "err" => %e);
                }
                Err(_) => {
                    debug!(self.shared.log, "timed out shutting down connection");
                }
            }
        }
    }
}

fn validate(req: &Request) -> Result<RequestType, Error> {
    match RequestType::try_from(req.request_type) {
        Ok(RequestType::Ping) => Ok(RequestType::Ping),
        Ok(t @ RequestType::Request) | Ok(t @ RequestType::Subscribe) => {
            if req.path_oneof.is_none() {
                return Err(Error::InvalidRequest("missing path"));
            }
            Ok(t)
        }
        _ => Err(Error::InvalidRequest("unspecified request type")),
    }
}
