// Copyright 2020 Joyent, Inc.

use std::convert::TryFrom;
use std::fmt;

use bytes::BytesMut;
use prost::encoding::{encode_varint, encoded_len_varint, WireType};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/*
 * Every frame starts with the tag of field 0 using the length-delimited wire
 * type, followed by the payload length.
 */
const ENVELOPE_FIELD: u64 = 0;
const ENVELOPE_TAG: u64 = (ENVELOPE_FIELD << 3) | WireType::LengthDelimited as u64;

const MAX_VARINT_LEN: usize = 10;
const MAX_PAYLOAD_LEN: u64 = i32::max_value() as u64;

/*
 * Request ids are allocated sequentially from a circular 31-bit space. Zero
 * is left for keepalive pings.
 */
pub const REQUEST_ID_MAX: i32 = i32::max_value();

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RequestType {
    Unspecified = 0,
    Ping = 1,
    Request = 2,
    Subscribe = 3,
}

impl RequestType {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            RequestType::Unspecified => "TYPE_UNSPECIFIED",
            RequestType::Ping => "TYPE_PING",
            RequestType::Request => "TYPE_REQUEST",
            RequestType::Subscribe => "TYPE_SUBSCRIBE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ResponseType {
    Unspecified = 0,
    Pong = 1,
    Response = 2,
    Update = 3,
}

impl ResponseType {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            ResponseType::Unspecified => "TYPE_UNSPECIFIED",
            ResponseType::Pong => "TYPE_PONG",
            ResponseType::Response => "TYPE_RESPONSE",
            ResponseType::Update => "TYPE_UPDATE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ResponseStatus {
    Unspecified = 0,
    Ok = 1,
    NotFound = 2,
    NotAuthorized = 3,
    InternalError = 4,
}

impl ResponseStatus {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            ResponseStatus::Unspecified => "STATUS_UNSPECIFIED",
            ResponseStatus::Ok => "STATUS_OK",
            ResponseStatus::NotFound => "STATUS_NOT_FOUND",
            ResponseStatus::NotAuthorized => "STATUS_NOT_AUTHORIZED",
            ResponseStatus::InternalError => "STATUS_INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str_name())
    }
}

/// Identifies the resource a request refers to, either by its full path or
/// by a hash previously registered in a
/// [`PathHashRegistry`](crate::hash::PathHashRegistry).
#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum PathOneof {
    #[prost(uint32, tag = "3")]
    PathHash(u32),
    #[prost(string, tag = "4")]
    Path(String),
}

impl From<&str> for PathOneof {
    fn from(path: &str) -> PathOneof {
        PathOneof::Path(path.to_string())
    }
}

impl From<String> for PathOneof {
    fn from(path: String) -> PathOneof {
        PathOneof::Path(path)
    }
}

impl From<u32> for PathOneof {
    fn from(hash: u32) -> PathOneof {
        PathOneof::PathHash(hash)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(int32, tag = "1")]
    pub request_id: i32,
    #[prost(enumeration = "RequestType", tag = "2")]
    pub request_type: i32,
    #[prost(oneof = "PathOneof", tags = "3, 4")]
    pub path_oneof: Option<PathOneof>,
    #[prost(bytes = "vec", repeated, tag = "5")]
    pub data: Vec<Vec<u8>>,
}

impl Request {
    pub fn new(
        request_type: RequestType,
        request_id: i32,
        path: Option<PathOneof>,
    ) -> Request {
        Request {
            request_id,
            request_type: request_type as i32,
            path_oneof: path,
            data: Vec::new(),
        }
    }

    /// A PING with id 0 is a pure keepalive; its PONG is not correlated.
    pub fn ping(request_id: i32) -> Request {
        Request::new(RequestType::Ping, request_id, None)
    }

    pub fn request(request_id: i32, path: impl Into<PathOneof>) -> Request {
        Request::new(RequestType::Request, request_id, Some(path.into()))
    }

    pub fn subscribe(request_id: i32, path: impl Into<PathOneof>) -> Request {
        Request::new(RequestType::Subscribe, request_id, Some(path.into()))
    }

    pub fn path(&self) -> Option<&str> {
        match self.path_oneof {
            Some(PathOneof::Path(ref path)) => Some(path),
            _ => None,
        }
    }

    pub fn path_hash(&self) -> Option<u32> {
        match self.path_oneof {
            Some(PathOneof::PathHash(hash)) => Some(hash),
            _ => None,
        }
    }

    pub fn set_payload<M: Message>(&mut self, payload: &M) {
        self.data = payload_data(payload);
    }

    pub fn with_payload<M: Message>(mut self, payload: &M) -> Request {
        self.set_payload(payload);
        self
    }

    /// Decodes the request arguments. An absent payload decodes as the
    /// default message.
    pub fn payload<M: Message + Default>(&self) -> Result<M, Error> {
        decode_payload(&self.data)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(int32, tag = "1")]
    pub request_id: i32,
    #[prost(enumeration = "ResponseType", tag = "2")]
    pub response_type: i32,
    #[prost(enumeration = "ResponseStatus", tag = "3")]
    pub response_status: i32,
    #[prost(string, tag = "4")]
    pub response_message: String,
    #[prost(bytes = "vec", repeated, tag = "5")]
    pub data: Vec<Vec<u8>>,
}

impl Response {
    pub fn new(
        response_type: ResponseType,
        request_id: i32,
        status: ResponseStatus,
    ) -> Response {
        Response {
            request_id,
            response_type: response_type as i32,
            response_status: status as i32,
            response_message: String::new(),
            data: Vec::new(),
        }
    }

    pub fn pong(request_id: i32) -> Response {
        Response::new(ResponseType::Pong, request_id, ResponseStatus::Ok)
    }

    pub fn reply(
        request_id: i32,
        status: ResponseStatus,
        message: impl Into<String>,
    ) -> Response {
        let mut res =
            Response::new(ResponseType::Response, request_id, status);
        res.response_message = message.into();
        res
    }

    pub fn update(request_id: i32) -> Response {
        Response::new(ResponseType::Update, request_id, ResponseStatus::Ok)
    }

    pub fn is_ok(&self) -> bool {
        self.response_status == ResponseStatus::Ok as i32
    }

    pub fn set_payload<M: Message>(&mut self, payload: &M) {
        self.data = payload_data(payload);
    }

    pub fn with_payload<M: Message>(mut self, payload: &M) -> Response {
        self.set_payload(payload);
        self
    }

    pub fn payload<M: Message + Default>(&self) -> Result<M, Error> {
        decode_payload(&self.data)
    }
}

/*
 * An empty encoding is stored as no data at all, so "no data" and "empty
 * data" can't be told apart on the wire.
 */
fn payload_data<M: Message>(payload: &M) -> Vec<Vec<u8>> {
    let encoded = payload.encode_to_vec();
    if encoded.is_empty() {
        Vec::new()
    } else {
        vec![encoded]
    }
}

fn decode_payload<M: Message + Default>(data: &[Vec<u8>]) -> Result<M, Error> {
    match data.first() {
        Some(bytes) => Ok(M::decode(bytes.as_slice())?),
        None => Ok(M::default()),
    }
}

/// Wraps a serialized message in a NanoRPC envelope.
pub fn encode<M: Message>(msg: &M) -> Vec<u8> {
    let payload = msg.encode_to_vec();
    let prefix_len = encoded_len_varint(ENVELOPE_TAG)
        + encoded_len_varint(payload.len() as u64);

    let mut out = Vec::with_capacity(prefix_len + payload.len());
    encode_varint(ENVELOPE_TAG, &mut out);
    encode_varint(payload.len() as u64, &mut out);
    out.extend_from_slice(&payload);
    out
}

/// Encodes a wrapped request. When `data` is given it replaces the request's
/// payload first.
pub fn encode_request<M: Message>(req: &mut Request, data: Option<&M>) -> Vec<u8> {
    if let Some(data) = data {
        req.set_payload(data);
    }
    encode(req)
}

/// Encodes a wrapped response. When `data` is given it replaces the
/// response's payload first.
pub fn encode_response<M: Message>(
    res: &mut Response,
    data: Option<&M>,
) -> Vec<u8> {
    if let Some(data) = data {
        res.set_payload(data);
    }
    encode(res)
}

/// Reads one varint from the front of `buf`, returning the value and the
/// number of bytes it occupied.
fn consume_varint(buf: &[u8]) -> Result<(u64, usize), Error> {
    let mut value: u64 = 0;

    for (i, byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        let low = u64::from(byte & 0x7f);
        if i == MAX_VARINT_LEN - 1 && low > 1 {
            return Err(Error::Malformed(String::from("varint overflow")));
        }
        value |= low << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }

    if buf.len() >= MAX_VARINT_LEN {
        Err(Error::Malformed(String::from("varint overflow")))
    } else {
        Err(Error::Incomplete)
    }
}

/// Identifies the size of the envelope prefix and of the payload at the
/// start of `buf`.
///
/// Returns [`Error::Incomplete`] when `buf` doesn't hold the whole message
/// yet, and [`Error::Malformed`] when it can never be a valid envelope.
pub fn decode_split(buf: &[u8]) -> Result<(usize, usize), Error> {
    let (tag, tag_len) = consume_varint(buf)?;

    let (field, wire_type) = (tag >> 3, tag & 0x7);
    if tag != ENVELOPE_TAG {
        let msg = format!("unexpected tag: <{},{}>", field, wire_type);
        return Err(Error::Malformed(msg));
    }

    let (size, size_len) = consume_varint(&buf[tag_len..])?;
    if size > MAX_PAYLOAD_LEN {
        let msg = format!("size out of range: {}", size);
        return Err(Error::Malformed(msg));
    }

    let prefix_len = tag_len + size_len;
    let payload_len = size as usize;

    if buf.len() < prefix_len + payload_len {
        return Err(Error::Incomplete);
    }

    Ok((prefix_len, payload_len))
}

/// Decodes one wrapped message from the front of `buf`, returning it along
/// with the number of bytes consumed.
pub fn decode<M: Message + Default>(buf: &[u8]) -> Result<(M, usize), Error> {
    let (prefix_len, payload_len) = decode_split(buf)?;
    let end = prefix_len + payload_len;
    let msg = M::decode(&buf[prefix_len..end])?;
    Ok((msg, end))
}

pub fn decode_response(buf: &[u8]) -> Result<(Response, usize), Error> {
    decode(buf)
}

pub fn decode_request(buf: &[u8]) -> Result<(Request, usize), Error> {
    decode(buf)
}

/// Carves the next whole envelope off the front of a stream buffer.
///
/// `Ok(None)` means more input is needed. At EOF a partial envelope is an
/// error.
pub fn split(buf: &[u8], at_eof: bool) -> Result<Option<(usize, &[u8])>, Error> {
    match decode_split(buf) {
        Ok((prefix_len, payload_len)) => {
            let n = prefix_len + payload_len;
            Ok(Some((n, &buf[..n])))
        }
        Err(Error::Incomplete) if !at_eof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Frames a byte stream into whole NanoRPC envelopes, and wraps outgoing
/// messages.
///
/// Decoded frames still carry their envelope prefix; pass them to
/// [`decode_response`] or [`decode_request`]. Keeping payload decoding out
/// of the codec means a message that fails to deserialize doesn't end the
/// stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct NanoRpcCodec;

impl NanoRpcCodec {
    fn next_frame(
        &mut self,
        buf: &mut BytesMut,
        at_eof: bool,
    ) -> Result<Option<BytesMut>, Error> {
        let advance = match split(&buf[..], at_eof)? {
            Some((advance, _)) => advance,
            None => return Ok(None),
        };
        Ok(Some(buf.split_to(advance)))
    }
}

impl Decoder for NanoRpcCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Error> {
        self.next_frame(buf, false)
    }

    fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        self.next_frame(buf, true)
    }
}

impl<M: Message> Encoder<M> for NanoRpcCodec {
    type Error = Error;

    fn encode(&mut self, item: M, buf: &mut BytesMut) -> Result<(), Error> {
        buf.extend_from_slice(&encode(&item));
        Ok(())
    }
}

impl TryFrom<&[u8]> for Response {
    type Error = Error;

    fn try_from(buf: &[u8]) -> Result<Response, Error> {
        decode_response(buf).map(|(res, _)| res)
    }
}

impl TryFrom<&[u8]> for Request {
    type Error = Error;

    fn try_from(buf: &[u8]) -> Result<Request, Error> {
        decode_request(buf).map(|(req, _)| req)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::{quickcheck, TestResult};

    use crate::error::{is_not_found, response_as_error};

    #[test]
    fn subscribe_round_trip() {
        let mut req = Request::subscribe(42, "/sensors/temp");
        let buf = encode_request::<()>(&mut req, None);

        let (decoded, consumed) = decode_request(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded.request_type(), RequestType::Subscribe);
        assert_eq!(decoded.request_id, 42);
        assert_eq!(decoded.path(), Some("/sensors/temp"));
        assert_eq!(decoded.path_hash(), None);
    }

    #[test]
    fn not_found_response_round_trip() {
        let mut res =
            Response::reply(42, ResponseStatus::NotFound, "unknown sensor");
        let buf = encode_response::<()>(&mut res, None);

        let (decoded, consumed) = decode_response(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, res);

        let err = response_as_error(Some(&decoded)).unwrap_err();
        assert_eq!(err.to_string(), "nanorpc: not found: unknown sensor");
        assert!(is_not_found(&err));
    }

    #[test]
    fn envelope_prefix() {
        let res = Response::pong(1);
        let buf = encode(&res);
        let body = res.encode_to_vec();

        assert_eq!(buf[0], 0x02);
        assert_eq!(buf[1] as usize, body.len());
        assert_eq!(&buf[2..], body.as_slice());
        assert_eq!(decode_split(&buf).unwrap(), (2, body.len()));
    }

    #[test]
    fn empty_message_frames_as_two_bytes() {
        let buf = encode(&Request::default());
        assert_eq!(buf, vec![0x02, 0x00]);

        let (req, consumed) = decode_request(&buf).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(req.request_type(), RequestType::Unspecified);
        assert_eq!(req.path_oneof, None);
    }

    #[test]
    fn path_hash_variant() {
        let req = Request::request(7, 0x1234_5678u32);
        let (decoded, _) = decode_request(&encode(&req)).unwrap();
        assert_eq!(decoded.path_hash(), Some(0x1234_5678));
        assert_eq!(decoded.path(), None);
    }

    #[test]
    fn payload_attached_only_when_non_empty() {
        let mut req = Request::request(1, "/echo");
        req.set_payload(&String::from("hello"));
        assert_eq!(req.data.len(), 1);
        assert_eq!(req.payload::<String>().unwrap(), "hello");

        req.set_payload(&String::new());
        assert!(req.data.is_empty());
        assert_eq!(req.payload::<String>().unwrap(), "");

        let res = Response::update(1).with_payload(&0u64);
        assert!(res.data.is_empty());
        let res = Response::update(1).with_payload(&12u64);
        assert_eq!(res.payload::<u64>().unwrap(), 12);
    }

    #[test]
    fn encode_request_replaces_payload() {
        let mut req = Request::request(3, "/echo").with_payload(&1u32);
        let buf = encode_request(&mut req, Some(&String::from("abc")));
        let (decoded, _) = decode_request(&buf).unwrap();
        assert_eq!(decoded.payload::<String>().unwrap(), "abc");
    }

    #[test]
    fn bad_tag_is_malformed() {
        // field 1, length-delimited
        let err = decode_split(&[0x0a, 0x00]).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{:?}", err);

        // field 0, varint
        let err = decode_split(&[0x00, 0x00]).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{:?}", err);

        let err = split(&[0x0a, 0x00], false).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{:?}", err);
    }

    #[test]
    fn oversized_length_is_malformed() {
        let mut buf = vec![0x02];
        encode_varint(u64::from(u32::max_value()), &mut buf);
        let err = decode_split(&buf).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{:?}", err);
    }

    #[test]
    fn overlong_varint_is_malformed() {
        let buf = [0xffu8; 11];
        let err = decode_split(&buf).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{:?}", err);
    }

    #[test]
    fn short_buffers_are_incomplete() {
        assert!(matches!(decode_split(&[]), Err(Error::Incomplete)));
        assert!(matches!(decode_split(&[0x02]), Err(Error::Incomplete)));
        assert!(matches!(decode_split(&[0x02, 0x85]), Err(Error::Incomplete)));
        assert!(matches!(decode_split(&[0x02, 0x03, 0x08]), Err(Error::Incomplete)));

        assert!(split(&[0x02, 0x03], false).unwrap().is_none());
        assert!(matches!(split(&[0x02, 0x03], true), Err(Error::Incomplete)));
    }

    #[test]
    fn split_returns_first_frame_only() {
        let mut stream = encode(&Response::pong(1));
        let first_len = stream.len();
        stream.extend(encode(&Response::update(2)));

        let (advance, frame) = split(&stream, false).unwrap().unwrap();
        assert_eq!(advance, first_len);
        assert_eq!(frame, &stream[..first_len]);

        let (res, _) = decode_response(&stream[advance..]).unwrap();
        assert_eq!(res.response_type(), ResponseType::Update);
    }

    #[test]
    fn codec_reassembles_chunks() {
        let mut codec = NanoRpcCodec;
        let mut wire = encode(&Response::update(3).with_payload(&1u32));
        wire.extend(encode(&Response::update(3).with_payload(&2u32)));

        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for byte in wire {
            buf.extend_from_slice(&[byte]);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                frames.push(decode_response(&frame).unwrap().0);
            }
        }

        assert!(buf.is_empty());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload::<u32>().unwrap(), 1);
        assert_eq!(frames[1].payload::<u32>().unwrap(), 2);
    }

    #[test]
    fn codec_eof_with_partial_frame() {
        let mut codec = NanoRpcCodec;
        let wire = encode(&Response::pong(9));

        let mut buf = BytesMut::from(&wire[..wire.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(matches!(codec.decode_eof(&mut buf), Err(Error::Incomplete)));

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn codec_encodes_envelopes() {
        let mut codec = NanoRpcCodec;
        let mut buf = BytesMut::new();
        let req = Request::ping(5);
        codec.encode(req.clone(), &mut buf).unwrap();
        assert_eq!(buf.as_ref(), encode(&req).as_slice());
    }

    #[test]
    fn undecodable_payload_is_a_decode_error() {
        // a length-delimited field 1 claiming more bytes than present
        let buf = [0x02, 0x02, 0x0a, 0x05];
        let err = decode_response(&buf).unwrap_err();
        assert!(matches!(err, Error::Decode(_)), "{:?}", err);
    }

    #[test]
    fn enum_names() {
        for t in &[
            RequestType::Unspecified,
            RequestType::Ping,
            RequestType::Request,
            RequestType::Subscribe,
        ] {
            assert!(t.as_str_name().starts_with("TYPE_"));
        }
        for t in &[
            ResponseType::Unspecified,
            ResponseType::Pong,
            ResponseType::Response,
            ResponseType::Update,
        ] {
            assert!(t.as_str_name().starts_with("TYPE_"));
        }
        assert_eq!(ResponseStatus::NotFound.to_string(), "STATUS_NOT_FOUND");
    }

    #[test]
    fn request_round_trip_property() {
        fn prop(id: i32, path: String, hashed: bool, data: Vec<u8>) -> bool {
            let path: PathOneof = if hashed {
                PathOneof::PathHash(id as u32)
            } else {
                path.into()
            };
            let mut req = Request::subscribe(id, path);
            if !data.is_empty() {
                req.data = vec![data];
            }
            let buf = encode(&req);
            match decode_request(&buf) {
                Ok((decoded, consumed)) => decoded == req && consumed == buf.len(),
                Err(_) => false,
            }
        }
        quickcheck(prop as fn(i32, String, bool, Vec<u8>) -> bool);
    }

    #[test]
    fn truncated_frames_are_incomplete_property() {
        fn prop(id: i32, status: i32, msg: String, cut: usize) -> TestResult {
            let mut res = Response::reply(id, ResponseStatus::Ok, msg);
            res.response_status = status;
            let buf = encode(&res);
            let cut = cut % buf.len();

            let incomplete = matches!(decode_split(&buf[..cut]), Err(Error::Incomplete));
            let needs_more = matches!(split(&buf[..cut], false), Ok(None));
            TestResult::from_bool(incomplete && needs_more)
        }
        quickcheck(prop as fn(i32, i32, String, usize) -> TestResult);
    }
}
