//! OCPP 2.1 message catalog
//!
//! Device-model messages (GetVariables / SetVariables) are what relays
//! usually police, so they carry the component and variable structures in
//! full. BinaryDataTransfer is the one operation with a binary payload.

use chrono::{DateTime, Utc};
use nn_core::{Catalog, CodecError, Operation, Payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::*;

// ============================================================================
// Enumerations
// ============================================================================

/// Boot reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootReason {
    ApplicationReset,
    FirmwareUpdate,
    LocalReset,
    PowerUp,
    RemoteReset,
    ScheduledReset,
    Triggered,
    Unknown,
    Watchdog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetType {
    Immediate,
    OnIdle,
    ImmediateAndResume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetStatus {
    Accepted,
    Rejected,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    Actual,
    Target,
    MinSet,
    MaxSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetVariableStatus {
    Accepted,
    Rejected,
    UnknownComponent,
    UnknownVariable,
    NotSupportedAttributeType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetVariableStatus {
    Accepted,
    Rejected,
    UnknownComponent,
    UnknownVariable,
    NotSupportedAttributeType,
    RebootRequired,
}

// ============================================================================
// Device model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evse {
    pub id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evse: Option<Evse>,
}

impl Component {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: None,
            evse: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl Variable {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: None,
        }
    }
}

// ============================================================================
// BootNotification
// ============================================================================

/// BootNotification request (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charging_station: ChargingStationInfo,
    pub reason: BootReason,
}

/// Charging station information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingStationInfo {
    pub model: String,
    pub vendor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

/// BootNotification response (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    pub interval: i32,
    pub status: RegistrationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

json_operation!(
    BootNotification, "BootNotification", BootNotificationRequest => BootNotificationResponse,
    |_, reason| BootNotificationResponse {
        current_time: Utc::now(),
        interval: 0,
        status: RegistrationStatus::Rejected,
        status_info: Some(StatusInfo::filtered(reason)),
    }
);

// ============================================================================
// Heartbeat
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

json_operation!(
    Heartbeat, "Heartbeat", HeartbeatRequest => HeartbeatResponse,
    |_, _| HeartbeatResponse { current_time: Utc::now() }
);

// ============================================================================
// Reset
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub kind: ResetType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evse_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub status: ResetStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

json_operation!(
    Reset, "Reset", ResetRequest => ResetResponse,
    |_, reason| ResetResponse {
        status: ResetStatus::Rejected,
        status_info: Some(StatusInfo::filtered(reason)),
    }
);

// ============================================================================
// GetVariables
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetVariableData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_type: Option<AttributeType>,
    pub component: Component,
    pub variable: Variable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetVariablesRequest {
    pub get_variable_data: Vec<GetVariableData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetVariableResult {
    pub attribute_status: GetVariableStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_status_info: Option<StatusInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_type: Option<AttributeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_value: Option<String>,
    pub component: Component,
    pub variable: Variable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetVariablesResponse {
    pub get_variable_result: Vec<GetVariableResult>,
}

json_operation!(
    /// Rejected lookups answer every requested variable with `Rejected`
    GetVariables, "GetVariables", GetVariablesRequest => GetVariablesResponse,
    |request, reason| GetVariablesResponse {
        get_variable_result: request
            .get_variable_data
            .iter()
            .map(|data| GetVariableResult {
                attribute_status: GetVariableStatus::Rejected,
                attribute_status_info: Some(StatusInfo::filtered(reason)),
                attribute_type: data.attribute_type,
                attribute_value: None,
                component: data.component.clone(),
                variable: data.variable.clone(),
            })
            .collect(),
    }
);

// ============================================================================
// SetVariables
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariableData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_type: Option<AttributeType>,
    pub attribute_value: String,
    pub component: Component,
    pub variable: Variable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariablesRequest {
    pub set_variable_data: Vec<SetVariableData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariableResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_type: Option<AttributeType>,
    pub attribute_status: SetVariableStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_status_info: Option<StatusInfo>,
    pub component: Component,
    pub variable: Variable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariablesResponse {
    pub set_variable_result: Vec<SetVariableResult>,
}

json_operation!(
    SetVariables, "SetVariables", SetVariablesRequest => SetVariablesResponse,
    |request, reason| SetVariablesResponse {
        set_variable_result: request
            .set_variable_data
            .iter()
            .map(|data| SetVariableResult {
                attribute_type: data.attribute_type,
                attribute_status: SetVariableStatus::Rejected,
                attribute_status_info: Some(StatusInfo::filtered(reason)),
                component: data.component.clone(),
                variable: data.variable.clone(),
            })
            .collect(),
    }
);

// ============================================================================
// DataTransfer
// ============================================================================

/// Keeps an explicit `null` apart from an absent member
fn present<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

json_operation!(
    DataTransfer, "DataTransfer", DataTransferRequest => DataTransferResponse,
    |_, reason| DataTransferResponse {
        status: DataTransferStatus::Rejected,
        status_info: Some(StatusInfo::filtered(reason)),
        data: None,
    }
);

// ============================================================================
// BinaryDataTransfer
// ============================================================================

/// Vendor-specific binary blob
///
/// Payload layout: `[vendor len:u16][vendor][message id len:u16][message id][data]`,
/// lengths little-endian; an empty message id means none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryDataTransferRequest {
    pub vendor_id: String,
    pub message_id: Option<String>,
    pub data: Vec<u8>,
}

/// Payload layout: `[status:u8][data]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryDataTransferResponse {
    pub status: DataTransferStatus,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct BinaryDataTransfer;

impl BinaryDataTransfer {
    fn bytes(payload: &Payload) -> Result<&[u8], CodecError> {
        payload.as_bytes().ok_or_else(|| CodecError::WrongEncoding {
            action: Self::ACTION.to_string(),
            expected: "binary",
        })
    }

    fn invalid(reason: &str) -> CodecError {
        CodecError::Invalid {
            action: Self::ACTION.to_string(),
            reason: reason.to_string(),
        }
    }

    fn put_str(out: &mut Vec<u8>, value: &str) -> Result<(), CodecError> {
        let len = u16::try_from(value.len()).map_err(|_| CodecError::Serialize {
            action: Self::ACTION.to_string(),
            reason: "string longer than 65535 bytes".to_string(),
        })?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn take_str<'a>(input: &mut &'a [u8]) -> Result<&'a str, CodecError> {
        if input.len() < 2 {
            return Err(Self::invalid("truncated string length"));
        }
        let len = u16::from_le_bytes([input[0], input[1]]) as usize;
        let rest = &input[2..];
        if rest.len() < len {
            return Err(Self::invalid("truncated string"));
        }
        let (value, rest) = rest.split_at(len);
        *input = rest;
        std::str::from_utf8(value).map_err(|_| Self::invalid("string is not UTF-8"))
    }

    fn status_byte(status: DataTransferStatus) -> u8 {
        match status {
            DataTransferStatus::Accepted => 0,
            DataTransferStatus::Rejected => 1,
            DataTransferStatus::UnknownMessageId => 2,
            DataTransferStatus::UnknownVendorId => 3,
        }
    }
}

impl Operation for BinaryDataTransfer {
    const ACTION: &'static str = "BinaryDataTransfer";
    type Request = BinaryDataTransferRequest;
    type Response = BinaryDataTransferResponse;

    fn parse_request(payload: &Payload) -> Result<BinaryDataTransferRequest, CodecError> {
        let mut input = Self::bytes(payload)?;
        let vendor_id = Self::take_str(&mut input)?;
        if vendor_id.is_empty() {
            return Err(Self::invalid("vendor id is mandatory"));
        }
        let vendor_id = vendor_id.to_string();
        let message_id = Self::take_str(&mut input)?;
        Ok(BinaryDataTransferRequest {
            vendor_id,
            message_id: (!message_id.is_empty()).then(|| message_id.to_string()),
            data: input.to_vec(),
        })
    }

    fn request_payload(request: &BinaryDataTransferRequest) -> Result<Payload, CodecError> {
        let mut out = Vec::with_capacity(4 + request.vendor_id.len() + request.data.len());
        Self::put_str(&mut out, &request.vendor_id)?;
        Self::put_str(&mut out, request.message_id.as_deref().unwrap_or(""))?;
        out.extend_from_slice(&request.data);
        Ok(Payload::Binary(out))
    }

    fn parse_response(payload: &Payload) -> Result<BinaryDataTransferResponse, CodecError> {
        let bytes = Self::bytes(payload)?;
        let Some((&status, data)) = bytes.split_first() else {
            return Err(Self::invalid("missing status"));
        };
        let status = match status {
            0 => DataTransferStatus::Accepted,
            1 => DataTransferStatus::Rejected,
            2 => DataTransferStatus::UnknownMessageId,
            3 => DataTransferStatus::UnknownVendorId,
            other => return Err(Self::invalid(&format!("unknown status {}", other))),
        };
        Ok(BinaryDataTransferResponse {
            status,
            data: data.to_vec(),
        })
    }

    fn response_payload(response: &BinaryDataTransferResponse) -> Result<Payload, CodecError> {
        let mut out = Vec::with_capacity(1 + response.data.len());
        out.push(Self::status_byte(response.status));
        out.extend_from_slice(&response.data);
        Ok(Payload::Binary(out))
    }

    fn rejected(_request: &BinaryDataTransferRequest, _reason: &str) -> BinaryDataTransferResponse {
        BinaryDataTransferResponse {
            status: DataTransferStatus::Rejected,
            data: Vec::new(),
        }
    }
}

/// Catalog of every OCPP 2.1 operation above
pub fn catalog() -> Catalog {
    Catalog::builder("ocpp2.1")
        .register::<BootNotification>()
        .register::<Heartbeat>()
        .register::<Reset>()
        .register::<GetVariables>()
        .register::<SetVariables>()
        .register::<DataTransfer>()
        .register::<BinaryDataTransfer>()
        .build()
}
