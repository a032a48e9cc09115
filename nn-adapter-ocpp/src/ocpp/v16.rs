//! OCPP 1.6 message catalog
//!
//! Core profile messages a networking node routes most often. Field names
//! follow the OCPP-J 1.6 JSON schemas.

use chrono::{DateTime, Utc};
use nn_core::Catalog;
use serde::{Deserialize, Serialize};

use super::types::*;

// ============================================================================
// Enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ResetType {
    Hard,
    Soft,
}

/// ChangeConfiguration outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ConfigurationStatus {
    Accepted,
    Rejected,
    RebootRequired,
    NotSupported,
}

// ============================================================================
// BootNotification
// ============================================================================

/// BootNotification request (CP -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_box_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iccid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imsi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_serial_number: Option<String>,
}

impl BootNotificationRequest {
    pub fn new(vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            charge_point_vendor: vendor.into(),
            charge_point_model: model.into(),
            charge_point_serial_number: None,
            charge_box_serial_number: None,
            firmware_version: None,
            iccid: None,
            imsi: None,
            meter_type: None,
            meter_serial_number: None,
        }
    }
}

/// BootNotification response (CSMS -> CP)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    pub interval: i32,
    pub status: RegistrationStatus,
}

json_operation!(
    /// Station announces itself after (re)boot
    BootNotification, "BootNotification", BootNotificationRequest => BootNotificationResponse,
    |_, _| BootNotificationResponse {
        current_time: Utc::now(),
        interval: 0,
        status: RegistrationStatus::Rejected,
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
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub kind: ResetType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetResponse {
    pub status: GenericStatus,
}

json_operation!(
    Reset, "Reset", ResetRequest => ResetResponse,
    |_, _| ResetResponse { status: GenericStatus::Rejected }
);

// ============================================================================
// GetConfiguration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GetConfigurationRequest {
    /// Keys to report; all keys when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValue {
    pub key: String,
    pub readonly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigurationResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_key: Option<Vec<KeyValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknown_key: Option<Vec<String>>,
}

json_operation!(
    /// Rejected lookups report every requested key as unknown
    GetConfiguration, "GetConfiguration", GetConfigurationRequest => GetConfigurationResponse,
    |request, _| GetConfigurationResponse {
        configuration_key: None,
        unknown_key: request.key.clone(),
    }
);

// ============================================================================
// ChangeConfiguration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConfigurationRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConfigurationResponse {
    pub status: ConfigurationStatus,
}

json_operation!(
    ChangeConfiguration, "ChangeConfiguration", ChangeConfigurationRequest => ChangeConfigurationResponse,
    |_, _| ChangeConfigurationResponse { status: ConfigurationStatus::Rejected }
);

// ============================================================================
// DataTransfer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

json_operation!(
    DataTransfer, "DataTransfer", DataTransferRequest => DataTransferResponse,
    |_, _| DataTransferResponse {
        status: DataTransferStatus::Rejected,
        data: None,
    }
);

/// Catalog of every OCPP 1.6 operation above
pub fn catalog() -> Catalog {
    Catalog::builder("ocpp1.6")
        .register::<BootNotification>()
        .register::<Heartbeat>()
        .register::<Reset>()
        .register::<GetConfiguration>()
        .register::<ChangeConfiguration>()
        .register::<DataTransfer>()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use nn_core::{CodecError, Operation, Payload};
    use serde_json::json;

    fn round_trip<O: Operation>(requests: Vec<O::Request>, responses: Vec<O::Response>)
    where
        O::Request: PartialEq,
        O::Response: PartialEq,
    {
        for request in requests {
            let payload = O::request_payload(&request).unwrap();
            assert_eq!(O::parse_request(&payload).unwrap(), request, "{} request {:?}", O::ACTION, payload);
        }
        for response in responses {
            let payload = O::response_payload(&response).unwrap();
            assert_eq!(O::parse_response(&payload).unwrap(), response, "{} response {:?}", O::ACTION, payload);
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_catalog_actions() {
        assert_eq!(
            catalog().actions(),
            vec![
                "BootNotification",
                "ChangeConfiguration",
                "DataTransfer",
                "GetConfiguration",
                "Heartbeat",
                "Reset",
            ]
        );
    }

    #[test]
    fn test_payloads_survive_round_trip() {
        round_trip::<BootNotification>(
            vec![
                BootNotificationRequest::new("EK", "M1"),
                BootNotificationRequest {
                    charge_point_serial_number: Some("CP-1".into()),
                    charge_box_serial_number: Some("CB-1".into()),
                    firmware_version: Some("1.2.3".into()),
                    iccid: Some("8938".into()),
                    imsi: Some("2620".into()),
                    meter_type: Some("AC".into()),
                    meter_serial_number: Some("M-9".into()),
                    ..BootNotificationRequest::new("EK", "M1")
                },
            ],
            vec![BootNotificationResponse {
                current_time: noon(),
                interval: 300,
                status: RegistrationStatus::Pending,
            }],
        );

        round_trip::<Heartbeat>(vec![HeartbeatRequest {}], vec![HeartbeatResponse { current_time: noon() }]);

        round_trip::<Reset>(
            vec![ResetRequest { kind: ResetType::Hard }, ResetRequest { kind: ResetType::Soft }],
            vec![ResetResponse { status: GenericStatus::Accepted }],
        );

        round_trip::<GetConfiguration>(
            vec![
                GetConfigurationRequest { key: None },
                GetConfigurationRequest {
                    key: Some(vec!["HeartbeatInterval".into(), "AuthorizationKey".into()]),
                },
            ],
            vec![
                GetConfigurationResponse::default(),
                GetConfigurationResponse {
                    configuration_key: Some(vec![
                        KeyValue {
                            key: "HeartbeatInterval".into(),
                            readonly: false,
                            value: Some("60".into()),
                        },
                        KeyValue {
                            key: "AuthorizationKey".into(),
                            readonly: true,
                            value: None,
                        },
                    ]),
                    unknown_key: Some(vec!["Nope".into()]),
                },
            ],
        );

        round_trip::<ChangeConfiguration>(
            vec![ChangeConfigurationRequest {
                key: "HeartbeatInterval".into(),
                value: "120".into(),
            }],
            vec![ChangeConfigurationResponse {
                status: ConfigurationStatus::RebootRequired,
            }],
        );

        round_trip::<DataTransfer>(
            vec![
                DataTransferRequest {
                    vendor_id: "EK".into(),
                    message_id: None,
                    data: None,
                },
                DataTransferRequest {
                    vendor_id: "EK".into(),
                    message_id: Some("meter".into()),
                    data: Some("{\"kwh\":12}".into()),
                },
            ],
            vec![
                DataTransferResponse {
                    status: DataTransferStatus::UnknownMessageId,
                    data: None,
                },
                DataTransferResponse {
                    status: DataTransferStatus::Accepted,
                    data: Some(String::new()),
                },
            ],
        );
    }

    #[test]
    fn test_boot_notification_wire_names() {
        let mut request = BootNotificationRequest::new("EK", "EK3");
        request.firmware_version = Some("0.1.0".to_string());

        let Payload::Json(value) = BootNotification::request_payload(&request).unwrap() else {
            panic!("expected JSON");
        };
        assert_eq!(
            value,
            json!({"chargePointVendor": "EK", "chargePointModel": "EK3", "firmwareVersion": "0.1.0"})
        );
    }

    #[test]
    fn test_missing_mandatory_field_is_invalid() {
        let payload = Payload::Json(json!({"chargePointVendor": "EK"}));
        let err = BootNotification::parse_request(&payload).unwrap_err();
        assert!(matches!(err, CodecError::Invalid { ref action, .. } if action == "BootNotification"));
    }

    #[test]
    fn test_reset_type_field() {
        let parsed = Reset::parse_request(&Payload::Json(json!({"type": "Soft"}))).unwrap();
        assert_eq!(parsed.kind, ResetType::Soft);

        assert!(Reset::parse_request(&Payload::Json(json!({"type": "Immediate"}))).is_err());
    }

    #[test]
    fn test_rejected_get_configuration_mirrors_keys() {
        let request = GetConfigurationRequest {
            key: Some(vec!["HeartbeatInterval".to_string()]),
        };
        let rejected = GetConfiguration::rejected(&request, "blocked");
        assert_eq!(rejected.unknown_key, Some(vec!["HeartbeatInterval".to_string()]));
        assert!(rejected.configuration_key.is_none());
    }

    #[test]
    fn test_binary_payload_is_wrong_encoding() {
        let err = Heartbeat::parse_request(&Payload::Binary(vec![1, 2])).unwrap_err();
        assert!(matches!(err, CodecError::WrongEncoding { expected: "JSON", .. }));
    }
}
