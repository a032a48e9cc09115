//! Wire framing for request and response envelopes
//!
//! JSON framing (OCPP-J compatible, carried in text frames):
//! - CALL: `[2, messageId, action, payload, header?]`
//! - CALLRESULT: `[3, messageId, payload, header?]`
//! - CALLERROR: `[4, messageId, errorCode, errorDescription, errorDetails, header?]`
//!
//! The optional trailing `header` object carries the networking extension
//! (destination, network path, timestamp, timeout, event tracking id,
//! result code). [`WireFormat::PlainJson`] never writes it, so plain OCPP-J
//! peers see standard frames.
//!
//! Binary framing (binary frames), all integers little-endian:
//! `[magic "NN":2][kind:1][id][action][destination][networkPath]`
//! `[timestamp ms:i64][timeout ms:u32][eventTrackingId][result:1][description]`
//! `[payloadKind:1][payloadLen:4][payload:N]`
//! where strings are `[len:u16][utf8]` and node lists `[count:u8][string]*`.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::envelope::{Payload, Request, Response, ResultCode};
use crate::types::{EventTrackingId, NetworkPath, NodeId, RequestId, SourceRouting};

/// Maximum payload size accepted in a binary frame (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

const BINARY_MAGIC: [u8; 2] = *b"NN";

const PAYLOAD_NONE: u8 = 0;
const PAYLOAD_JSON: u8 = 1;
const PAYLOAD_BINARY: u8 = 2;

/// A frame as handed to or received from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl WireFrame {
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Framing used for outbound messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireFormat {
    /// OCPP-J arrays with the networking header
    #[default]
    Json,
    /// OCPP-J arrays without the header
    PlainJson,
    /// Length-prefixed binary framing
    Binary,
}

/// OCPP-J message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageKind {
    fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            2 => Some(MessageKind::Call),
            3 => Some(MessageKind::CallResult),
            4 => Some(MessageKind::CallError),
            _ => None,
        }
    }
}

/// Errors in frame encoding and decoding
#[derive(Debug, Error)]
pub enum WireError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("malformed request {message_id}: {reason}")]
    MalformedCall { message_id: String, reason: String },

    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData { needed: usize, have: usize },

    #[error("payload too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge { size: usize },

    #[error("field too long: {0} bytes")]
    FieldTooLong(usize),

    #[error("binary payload cannot be carried in a JSON frame")]
    BinaryPayloadInJson,
}

impl WireError {
    /// Request id of a CALL that was framed well enough to answer
    pub fn call_id(&self) -> Option<&str> {
        match self {
            WireError::MalformedCall { message_id, .. } => Some(message_id),
            _ => None,
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone)]
pub enum Envelope {
    Request(Request),
    Response(Response),
}

impl Envelope {
    pub fn message_id(&self) -> &RequestId {
        match self {
            Envelope::Request(request) => request.request_id(),
            Envelope::Response(response) => response.request_id(),
        }
    }
}

/// Networking extension header of the JSON framing
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutingHeader {
    #[serde(default, skip_serializing_if = "SourceRouting::is_empty")]
    destination: SourceRouting,
    #[serde(default, skip_serializing_if = "NetworkPath::is_empty")]
    network_path: NetworkPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
    /// Milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_tracking_id: Option<EventTrackingId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<ResultCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

fn payload_for(payload: &Payload, include_signatures: bool) -> Payload {
    if include_signatures {
        payload.clone()
    } else {
        payload.without_signatures()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Encode a request in the given framing
pub fn encode_request(
    request: &Request,
    format: WireFormat,
    include_signatures: bool,
) -> Result<WireFrame, WireError> {
    let payload = payload_for(request.payload(), include_signatures);

    match format {
        WireFormat::Json | WireFormat::PlainJson => {
            let Payload::Json(value) = payload else {
                return Err(WireError::BinaryPayloadInJson);
            };

            let mut frame = vec![
                json!(MessageKind::Call as i32),
                json!(request.request_id()),
                json!(request.action()),
                value,
            ];

            if format == WireFormat::Json {
                let header = RoutingHeader {
                    destination: request.destination().clone(),
                    network_path: request.network_path().clone(),
                    timestamp: Some(request.created_at()),
                    timeout: Some(duration_ms(request.timeout())),
                    event_tracking_id: Some(request.event_tracking_id().clone()),
                    ..Default::default()
                };
                frame.push(serde_json::to_value(header)?);
            }

            Ok(WireFrame::Text(serde_json::to_string(&frame)?))
        }
        WireFormat::Binary => {
            let mut writer = FrameWriter::new(MessageKind::Call);
            writer.put_str(request.request_id().as_str())?;
            writer.put_str(request.action())?;
            writer.put_nodes(request.destination().hops())?;
            writer.put_nodes(request.network_path().nodes())?;
            writer.put_i64(request.created_at().timestamp_millis());
            writer.put_u32(u32::try_from(duration_ms(request.timeout())).unwrap_or(u32::MAX));
            writer.put_str(request.event_tracking_id().as_str())?;
            writer.put_u8(0);
            writer.put_str("")?;
            writer.put_payload(Some(&payload))?;
            Ok(WireFrame::Binary(writer.finish()))
        }
    }
}

/// Encode a response in the given framing.
///
/// Always yields a well-formed frame: when the payload cannot be expressed
/// in the chosen framing, an `InternalError` CALLERROR for the same request
/// id is produced instead.
pub fn encode_response(response: &Response, format: WireFormat, include_signatures: bool) -> WireFrame {
    match try_encode_response(response, format, include_signatures) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(
                "Failed to encode {} response {}: {}",
                response.action(),
                response.request_id(),
                e
            );
            let fallback = response
                .clone()
                .without_payload()
                .with_result(ResultCode::Exception, Some(format!("response encoding failed: {}", e)));
            error_frame(&fallback, format)
        }
    }
}

fn try_encode_response(
    response: &Response,
    format: WireFormat,
    include_signatures: bool,
) -> Result<WireFrame, WireError> {
    let payload = response.payload().map(|p| payload_for(p, include_signatures));

    match format {
        WireFormat::Json | WireFormat::PlainJson => match payload {
            Some(Payload::Json(value)) => {
                let mut frame = vec![
                    json!(MessageKind::CallResult as i32),
                    json!(response.request_id()),
                    value,
                ];
                if format == WireFormat::Json {
                    frame.push(serde_json::to_value(response_header(response))?);
                }
                Ok(WireFrame::Text(serde_json::to_string(&frame)?))
            }
            Some(Payload::Binary(_)) => Err(WireError::BinaryPayloadInJson),
            None => Ok(error_frame(response, format)),
        },
        WireFormat::Binary => {
            let kind = if payload.is_some() {
                MessageKind::CallResult
            } else {
                MessageKind::CallError
            };
            binary_response(response, kind, payload.as_ref())
        }
    }
}

fn response_header(response: &Response) -> RoutingHeader {
    RoutingHeader {
        destination: response.destination().clone(),
        network_path: response.network_path().clone(),
        timestamp: Some(response.timestamp()),
        event_tracking_id: response.event_tracking_id().cloned(),
        action: Some(response.action().to_string()),
        result: Some(response.result()),
        description: response.description().map(str::to_string),
        ..Default::default()
    }
}

/// CALLERROR frame for a response without payload
fn error_frame(response: &Response, format: WireFormat) -> WireFrame {
    match format {
        WireFormat::Binary => binary_response(response, MessageKind::CallError, None)
            .unwrap_or_else(|_| WireFrame::Binary(minimal_binary_error(response))),
        WireFormat::Json | WireFormat::PlainJson => {
            let mut frame = vec![
                json!(MessageKind::CallError as i32),
                json!(response.request_id()),
                json!(response.result().ocpp_error_code()),
                json!(response.description().unwrap_or_default()),
                json!({}),
            ];
            if format == WireFormat::Json {
                if let Ok(header) = serde_json::to_value(response_header(response)) {
                    frame.push(header);
                }
            }
            WireFrame::Text(Value::Array(frame).to_string())
        }
    }
}

fn binary_response(
    response: &Response,
    kind: MessageKind,
    payload: Option<&Payload>,
) -> Result<WireFrame, WireError> {
    let mut writer = FrameWriter::new(kind);
    writer.put_str(response.request_id().as_str())?;
    writer.put_str(response.action())?;
    writer.put_nodes(response.destination().hops())?;
    writer.put_nodes(response.network_path().nodes())?;
    writer.put_i64(response.timestamp().timestamp_millis());
    writer.put_u32(0);
    writer.put_str(response.event_tracking_id().map(EventTrackingId::as_str).unwrap_or(""))?;
    writer.put_u8(response.result().to_wire());
    writer.put_str(response.description().unwrap_or(""))?;
    writer.put_payload(payload)?;
    Ok(WireFrame::Binary(writer.finish()))
}

/// Last-resort error frame: request id and result only, truncated to fit
fn minimal_binary_error(response: &Response) -> Vec<u8> {
    let mut writer = FrameWriter::new(MessageKind::CallError);
    let id = response.request_id().as_str();
    let id = &id[..floor_char_boundary(id, u16::MAX as usize)];
    let _ = writer.put_str(id);
    let _ = writer.put_str("");
    writer.put_u8(0);
    writer.put_u8(0);
    writer.put_i64(response.timestamp().timestamp_millis());
    writer.put_u32(0);
    let _ = writer.put_str("");
    writer.put_u8(ResultCode::Exception.to_wire());
    let _ = writer.put_str("");
    writer.put_u8(PAYLOAD_NONE);
    writer.put_u32(0);
    writer.finish()
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0)
}

/// Decode a frame into a request or response envelope.
///
/// Frames without a networking header get `now` as their timestamp and
/// `default_timeout` as their timeout.
pub fn decode(frame: &WireFrame, default_timeout: Duration) -> Result<Envelope, WireError> {
    match frame {
        WireFrame::Text(text) => decode_json(text.as_bytes(), default_timeout),
        WireFrame::Binary(bytes) => decode_binary(bytes, default_timeout),
    }
}

fn decode_json(bytes: &[u8], default_timeout: Duration) -> Result<Envelope, WireError> {
    let array: Vec<Value> = serde_json::from_slice(bytes)?;

    let msg_type = array
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| WireError::InvalidFormat("missing message type".into()))?;
    let kind = MessageKind::from_tag(msg_type).ok_or(WireError::UnknownMessageType(msg_type))?;

    let message_id = array
        .get(1)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| WireError::InvalidFormat("missing message id".into()))?
        .to_string();

    let (base_len, header_index) = match kind {
        MessageKind::Call => (4, 4),
        MessageKind::CallResult => (3, 3),
        MessageKind::CallError => (5, 5),
    };

    let malformed = |reason: &str| match kind {
        MessageKind::Call => WireError::MalformedCall {
            message_id: message_id.clone(),
            reason: reason.to_string(),
        },
        _ => WireError::InvalidFormat(format!("{} ({})", reason, message_id)),
    };

    if array.len() != base_len && array.len() != base_len + 1 {
        return Err(malformed("unexpected number of elements"));
    }

    let header: RoutingHeader = match array.get(header_index) {
        None => RoutingHeader::default(),
        Some(value) if value.is_object() => serde_json::from_value(value.clone())
            .map_err(|e| malformed(&format!("invalid header: {}", e)))?,
        Some(_) => return Err(malformed("header is not an object")),
    };

    if header
        .destination
        .hops()
        .iter()
        .chain(header.network_path.nodes())
        .any(NodeId::is_empty)
    {
        return Err(malformed("routing path contains an empty node id"));
    }

    let request_id = RequestId::new(message_id.clone());

    match kind {
        MessageKind::Call => {
            let action = array[2]
                .as_str()
                .filter(|a| !a.is_empty())
                .ok_or_else(|| malformed("missing action"))?;

            let timeout = header
                .timeout
                .map(Duration::from_millis)
                .unwrap_or(default_timeout);

            let mut request = Request::new(
                action,
                header.destination,
                Payload::Json(array[3].clone()),
                timeout,
            )
            .with_request_id(request_id)
            .with_network_path(header.network_path);

            if let Some(timestamp) = header.timestamp {
                request = request.with_created_at(timestamp);
            }
            if let Some(tracking) = header.event_tracking_id {
                request = request.with_event_tracking_id(tracking);
            }
            Ok(Envelope::Request(request))
        }
        MessageKind::CallResult => {
            let result = header.result.unwrap_or(ResultCode::Ok);
            let response = Response::synthesized(
                request_id,
                header.action.unwrap_or_default(),
                result,
                header.description,
            )
            .with_payload(Payload::Json(array[2].clone()));
            Ok(Envelope::Response(finish_response(
                response,
                header.destination,
                header.network_path,
                header.timestamp,
                header.event_tracking_id,
            )))
        }
        MessageKind::CallError => {
            let error_code = array[2].as_str().unwrap_or("GenericError");
            let description = array[3]
                .as_str()
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .or(header.description);
            let result = header
                .result
                .unwrap_or_else(|| ResultCode::from_ocpp_error_code(error_code));
            let response = Response::synthesized(
                request_id,
                header.action.unwrap_or_default(),
                result,
                description,
            );
            Ok(Envelope::Response(finish_response(
                response,
                header.destination,
                header.network_path,
                header.timestamp,
                header.event_tracking_id,
            )))
        }
    }
}

fn finish_response(
    response: Response,
    destination: SourceRouting,
    network_path: NetworkPath,
    timestamp: Option<DateTime<Utc>>,
    event_tracking_id: Option<EventTrackingId>,
) -> Response {
    let mut response = response
        .with_destination(destination)
        .with_network_path(network_path);
    if let Some(timestamp) = timestamp {
        response = response.with_timestamp(timestamp);
    }
    if let Some(tracking) = event_tracking_id {
        response = response.with_event_tracking_id(tracking);
    }
    response
}

fn decode_binary(bytes: &[u8], default_timeout: Duration) -> Result<Envelope, WireError> {
    let mut reader = FrameReader::new(bytes);

    if reader.take(2)? != BINARY_MAGIC {
        return Err(WireError::InvalidFormat("bad magic".into()));
    }
    let tag = reader.u8()?;
    let kind = MessageKind::from_tag(tag as i64).ok_or(WireError::UnknownMessageType(tag as i64))?;

    let message_id = reader.string()?;
    if message_id.is_empty() {
        return Err(WireError::InvalidFormat("missing message id".into()));
    }

    // Everything after the id belongs to a message we can answer
    let fields = match BinaryFields::read(&mut reader) {
        Ok(fields) => fields,
        Err(e) if kind == MessageKind::Call => {
            return Err(WireError::MalformedCall {
                message_id,
                reason: e.to_string(),
            })
        }
        Err(e) => return Err(e),
    };
    let BinaryFields {
        action,
        destination,
        network_path,
        timestamp_ms,
        timeout_ms,
        tracking,
        result,
        description,
        payload,
    } = fields;

    if destination
        .hops()
        .iter()
        .chain(network_path.nodes())
        .any(NodeId::is_empty)
    {
        let reason = "routing path contains an empty node id".to_string();
        return Err(match kind {
            MessageKind::Call => WireError::MalformedCall { message_id, reason },
            _ => WireError::InvalidFormat(reason),
        });
    }

    let timestamp = Utc.timestamp_millis_opt(timestamp_ms).single();
    let tracking = (!tracking.is_empty()).then(|| EventTrackingId::new(tracking));
    let description = (!description.is_empty()).then_some(description);
    let request_id = RequestId::new(message_id.clone());

    match kind {
        MessageKind::Call => {
            if action.is_empty() {
                return Err(WireError::MalformedCall {
                    message_id,
                    reason: "missing action".into(),
                });
            }
            let payload = payload.ok_or_else(|| WireError::MalformedCall {
                message_id: message_id.clone(),
                reason: "missing payload".into(),
            })?;
            let timeout = if timeout_ms == 0 {
                default_timeout
            } else {
                Duration::from_millis(timeout_ms as u64)
            };

            let mut request = Request::new(action, destination, payload, timeout)
                .with_request_id(request_id)
                .with_network_path(network_path);
            if let Some(timestamp) = timestamp {
                request = request.with_created_at(timestamp);
            }
            if let Some(tracking) = tracking {
                request = request.with_event_tracking_id(tracking);
            }
            Ok(Envelope::Request(request))
        }
        MessageKind::CallResult | MessageKind::CallError => {
            let fallback = if kind == MessageKind::CallResult {
                ResultCode::Ok
            } else {
                ResultCode::Exception
            };
            let result = ResultCode::from_wire(result).unwrap_or(fallback);
            let mut response = Response::synthesized(request_id, action, result, description);
            if let Some(payload) = payload {
                response = response.with_payload(payload);
            }
            Ok(Envelope::Response(finish_response(
                response,
                destination,
                network_path,
                timestamp,
                tracking,
            )))
        }
    }
}

/// Binary frame fields following the message id
struct BinaryFields {
    action: String,
    destination: SourceRouting,
    network_path: NetworkPath,
    timestamp_ms: i64,
    timeout_ms: u32,
    tracking: String,
    result: u8,
    description: String,
    payload: Option<Payload>,
}

impl BinaryFields {
    fn read(reader: &mut FrameReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            action: reader.string()?,
            destination: SourceRouting::via(reader.nodes()?),
            network_path: NetworkPath::from_nodes(reader.nodes()?),
            timestamp_ms: reader.i64()?,
            timeout_ms: reader.u32()?,
            tracking: reader.string()?,
            result: reader.u8()?,
            description: reader.string()?,
            payload: reader.payload()?,
        })
    }
}

struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    fn new(kind: MessageKind) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&BINARY_MAGIC);
        buf.push(kind as u8);
        Self { buf }
    }

    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_str(&mut self, value: &str) -> Result<(), WireError> {
        let len = u16::try_from(value.len()).map_err(|_| WireError::FieldTooLong(value.len()))?;
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn put_nodes(&mut self, nodes: &[NodeId]) -> Result<(), WireError> {
        let count = u8::try_from(nodes.len()).map_err(|_| WireError::FieldTooLong(nodes.len()))?;
        self.put_u8(count);
        for node in nodes {
            self.put_str(node.as_str())?;
        }
        Ok(())
    }

    fn put_payload(&mut self, payload: Option<&Payload>) -> Result<(), WireError> {
        let (tag, bytes) = match payload {
            None => (PAYLOAD_NONE, Vec::new()),
            Some(Payload::Json(value)) => (PAYLOAD_JSON, serde_json::to_vec(value)?),
            Some(Payload::Binary(bytes)) => (PAYLOAD_BINARY, bytes.clone()),
        };
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge { size: bytes.len() });
        }
        self.put_u8(tag);
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(&bytes);
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(WireError::InsufficientData {
                needed: end,
                have: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_le_bytes(raw))
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| WireError::InvalidFormat("string is not valid UTF-8".into()))
    }

    fn nodes(&mut self) -> Result<Vec<NodeId>, WireError> {
        let count = self.u8()?;
        (0..count).map(|_| self.string().map(NodeId::from)).collect()
    }

    fn payload(&mut self) -> Result<Option<Payload>, WireError> {
        let tag = self.u8()?;
        let len = self.u32()? as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge { size: len });
        }
        let bytes = self.take(len)?;
        match tag {
            PAYLOAD_NONE => Ok(None),
            PAYLOAD_JSON => Ok(Some(Payload::Json(serde_json::from_slice(bytes)?))),
            PAYLOAD_BINARY => Ok(Some(Payload::Binary(bytes.to_vec()))),
            other => Err(WireError::InvalidFormat(format!("unknown payload kind {}", other))),
        }
    }
}
