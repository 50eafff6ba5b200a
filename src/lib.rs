// Copyright 2020 Joyent, Inc.

//! NanoRPC: a small RPC protocol with subscriptions over one byte stream
//!
//! A client keeps one connection open to a server and uses it to make
//! one-shot requests, send keepalive pings and subscribe to paths whose
//! changes the server pushes back as updates. Replies are matched to their
//! requests by id, so no handshake or substreams are needed.
//!
//! Protocol definition
//!
//! Every message on the wire is a protobuf message wrapped in an envelope:
//!
//! ```text
//! varint(tag)       field 0, wire type length-delimited (0x02)
//! varint(length)    number of payload bytes that follow
//! payload[length]   serialized Request or Response
//! ```
//!
//! There is no magic number, version or checksum. Which message the payload
//! holds follows from the direction of the connection: clients send
//! [`Request`]s and servers send [`Response`]s.
//!
//! * REQUEST    answered by exactly one RESPONSE with the same id.
//!
//! * SUBSCRIBE  answered by any number of UPDATEs carrying the subscription's
//!              id, optionally preceded by a RESPONSE. A non-OK RESPONSE
//!              ends the subscription.
//!
//! * PING       answered by a PONG echoing its id. A PING with id 0 is a
//!              keepalive whose PONG isn't correlated.
//!
//! Request ids are scoped to the connection. Sessions allocate them
//! sequentially from a circular 31-bit space when the caller leaves them at
//! zero.
//!
//! A REQUEST or SUBSCRIBE names its path either as a string or as a 32-bit
//! hash registered in a [`PathHashRegistry`].

pub mod client;
pub mod config;
pub mod error;
pub mod hash;
pub mod protocol;
pub mod server;

pub use crate::client::{Client, Correlation, PendingReply, Session, Subscription};
pub use crate::config::SessionConfig;
pub use crate::error::{
    is_no_response, is_not_authorized, is_not_found, response_as_error, Error,
    ErrorKind, ResponseError,
};
pub use crate::hash::{hash_path, PathHashRegistry};
pub use crate::server::UpdateSink;
pub use crate::protocol::{
    decode_request, decode_response, encode_request, encode_response,
    NanoRpcCodec, PathOneof, Request, RequestType, Response, ResponseStatus,
    ResponseType,
};
