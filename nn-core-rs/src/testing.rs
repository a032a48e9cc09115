//! Operations shared by unit tests

use serde::{Deserialize, Serialize};

use crate::catalog::{json, Catalog, CodecError, Operation};
use crate::envelope::Payload;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub status: String,
}

pub struct Reset;

impl Operation for Reset {
    const ACTION: &'static str = "Reset";
    type Request = ResetRequest;
    type Response = ResetResponse;

    fn parse_request(payload: &Payload) -> Result<ResetRequest, CodecError> {
        json::parse(Self::ACTION, payload)
    }

    fn request_payload(request: &ResetRequest) -> Result<Payload, CodecError> {
        json::payload(Self::ACTION, request)
    }

    fn parse_response(payload: &Payload) -> Result<ResetResponse, CodecError> {
        json::parse(Self::ACTION, payload)
    }

    fn response_payload(response: &ResetResponse) -> Result<Payload, CodecError> {
        json::payload(Self::ACTION, response)
    }

    fn rejected(_request: &ResetRequest, _reason: &str) -> ResetResponse {
        ResetResponse {
            status: "Rejected".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: String,
}

pub struct Heartbeat;

impl Operation for Heartbeat {
    const ACTION: &'static str = "Heartbeat";
    type Request = HeartbeatRequest;
    type Response = HeartbeatResponse;

    fn parse_request(payload: &Payload) -> Result<HeartbeatRequest, CodecError> {
        json::parse(Self::ACTION, payload)
    }

    fn request_payload(request: &HeartbeatRequest) -> Result<Payload, CodecError> {
        json::payload(Self::ACTION, request)
    }

    fn parse_response(payload: &Payload) -> Result<HeartbeatResponse, CodecError> {
        json::parse(Self::ACTION, payload)
    }

    fn response_payload(response: &HeartbeatResponse) -> Result<Payload, CodecError> {
        json::payload(Self::ACTION, response)
    }

    fn rejected(_request: &HeartbeatRequest, _reason: &str) -> HeartbeatResponse {
        HeartbeatResponse {
            current_time: String::new(),
        }
    }
}

pub fn catalog() -> Catalog {
    Catalog::builder("test")
        .register::<Reset>()
        .register::<Heartbeat>()
        .build()
}

pub fn reset(kind: &str) -> ResetRequest {
    ResetRequest { kind: kind.into() }
}
