//! Terminal behaviour of the CSMS and charging station roles

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nn_adapter_ocpp::ocpp::{v16, v21, DataTransferStatus, GenericStatus, OcppVersion, RegistrationStatus};
use nn_core::{CancellationToken, NetworkingNode, NodeBuilder, SendOptions, SourceRouting};
use parking_lot::Mutex;
use tracing::{info, warn};

/// Heartbeat interval handed out by the CSMS, in seconds
const HEARTBEAT_INTERVAL: i32 = 60;

/// Delay before a station retries an unanswered or refused boot
const BOOT_RETRY: Duration = Duration::from_secs(10);

const HEARTBEAT_KEY: &str = "HeartbeatInterval";

/// Station configuration: OCPP 1.6 keys, or `Component.Variable` for 2.1
pub type Settings = Arc<Mutex<HashMap<String, String>>>;

pub fn default_settings() -> Settings {
    let mut settings = HashMap::new();
    settings.insert(HEARTBEAT_KEY.to_string(), HEARTBEAT_INTERVAL.to_string());
    settings.insert("OCPPCommCtrlr.HeartbeatInterval".to_string(), HEARTBEAT_INTERVAL.to_string());
    Arc::new(Mutex::new(settings))
}

// ============================================================================
// CSMS
// ============================================================================

/// Answer station-originated messages
pub fn csms(builder: NodeBuilder, version: OcppVersion) -> NodeBuilder {
    match version {
        OcppVersion::V16 => builder
            .on::<v16::BootNotification, _, _>(|ctx, request| async move {
                info!(
                    "{} booted: {} {}",
                    ctx.request.network_path().origin().unwrap_or(&ctx.connection),
                    request.charge_point_vendor,
                    request.charge_point_model
                );
                Some(v16::BootNotificationResponse {
                    current_time: Utc::now(),
                    interval: HEARTBEAT_INTERVAL,
                    status: RegistrationStatus::Accepted,
                })
            })
            .on::<v16::Heartbeat, _, _>(|_, _| async {
                Some(v16::HeartbeatResponse {
                    current_time: Utc::now(),
                })
            })
            .on::<v16::DataTransfer, _, _>(|_, _| async {
                Some(v16::DataTransferResponse {
                    status: DataTransferStatus::UnknownVendorId,
                    data: None,
                })
            }),
        OcppVersion::V21 => builder
            .on::<v21::BootNotification, _, _>(|ctx, request| async move {
                info!(
                    "{} booted ({:?}): {} {}",
                    ctx.request.network_path().origin().unwrap_or(&ctx.connection),
                    request.reason,
                    request.charging_station.vendor_name,
                    request.charging_station.model
                );
                Some(v21::BootNotificationResponse {
                    current_time: Utc::now(),
                    interval: HEARTBEAT_INTERVAL,
                    status: RegistrationStatus::Accepted,
                    status_info: None,
                })
            })
            .on::<v21::Heartbeat, _, _>(|_, _| async {
                Some(v21::HeartbeatResponse {
                    current_time: Utc::now(),
                })
            })
            .on::<v21::DataTransfer, _, _>(|_, _| async {
                Some(v21::DataTransferResponse {
                    status: DataTransferStatus::UnknownVendorId,
                    status_info: None,
                    data: None,
                })
            })
            .on::<v21::BinaryDataTransfer, _, _>(|_, _| async {
                Some(v21::BinaryDataTransferResponse {
                    status: DataTransferStatus::UnknownVendorId,
                    data: Vec::new(),
                })
            }),
    }
}

// ============================================================================
// Charging station
// ============================================================================

/// Answer CSMS-originated messages from `settings`
pub fn station(builder: NodeBuilder, version: OcppVersion, settings: Settings) -> NodeBuilder {
    match version {
        OcppVersion::V16 => {
            let read = settings.clone();
            builder
                .on::<v16::Reset, _, _>(|_, request| async move {
                    info!("Reset ({:?}) requested", request.kind);
                    Some(v16::ResetResponse {
                        status: GenericStatus::Accepted,
                    })
                })
                .on::<v16::GetConfiguration, _, _>(move |_, request| {
                    let response = get_configuration(&read.lock(), request);
                    async move { Some(response) }
                })
                .on::<v16::ChangeConfiguration, _, _>(move |_, request| {
                    settings.lock().insert(request.key, request.value);
                    async {
                        Some(v16::ChangeConfigurationResponse {
                            status: v16::ConfigurationStatus::Accepted,
                        })
                    }
                })
        }
        OcppVersion::V21 => {
            let read = settings.clone();
            builder
                .on::<v21::Reset, _, _>(|_, request| async move {
                    info!("Reset ({:?}) requested", request.kind);
                    Some(v21::ResetResponse {
                        status: v21::ResetStatus::Accepted,
                        status_info: None,
                    })
                })
                .on::<v21::GetVariables, _, _>(move |_, request| {
                    let response = get_variables(&read.lock(), request);
                    async move { Some(response) }
                })
                .on::<v21::SetVariables, _, _>(move |_, request| {
                    let response = set_variables(&mut settings.lock(), request);
                    async move { Some(response) }
                })
        }
    }
}

fn get_configuration(settings: &HashMap<String, String>, request: v16::GetConfigurationRequest) -> v16::GetConfigurationResponse {
    let keys = request.key.unwrap_or_else(|| settings.keys().cloned().collect());
    let (known, unknown): (Vec<_>, Vec<_>) = keys.into_iter().partition(|key| settings.contains_key(key));

    v16::GetConfigurationResponse {
        configuration_key: Some(
            known
                .into_iter()
                .map(|key| v16::KeyValue {
                    value: settings.get(&key).cloned(),
                    readonly: false,
                    key,
                })
                .collect(),
        ),
        unknown_key: (!unknown.is_empty()).then_some(unknown),
    }
}

fn variable_key(component: &v21::Component, variable: &v21::Variable) -> String {
    format!("{}.{}", component.name, variable.name)
}

fn get_variables(settings: &HashMap<String, String>, request: v21::GetVariablesRequest) -> v21::GetVariablesResponse {
    v21::GetVariablesResponse {
        get_variable_result: request
            .get_variable_data
            .into_iter()
            .map(|data| {
                let value = settings.get(&variable_key(&data.component, &data.variable)).cloned();
                v21::GetVariableResult {
                    attribute_status: if value.is_some() {
                        v21::GetVariableStatus::Accepted
                    } else {
                        v21::GetVariableStatus::UnknownVariable
                    },
                    attribute_status_info: None,
                    attribute_type: data.attribute_type,
                    attribute_value: value,
                    component: data.component,
                    variable: data.variable,
                }
            })
            .collect(),
    }
}

fn set_variables(settings: &mut HashMap<String, String>, request: v21::SetVariablesRequest) -> v21::SetVariablesResponse {
    v21::SetVariablesResponse {
        set_variable_result: request
            .set_variable_data
            .into_iter()
            .map(|data| {
                settings.insert(variable_key(&data.component, &data.variable), data.attribute_value);
                v21::SetVariableResult {
                    attribute_type: data.attribute_type,
                    attribute_status: v21::SetVariableStatus::Accepted,
                    attribute_status_info: None,
                    component: data.component,
                    variable: data.variable,
                }
            })
            .collect(),
    }
}

/// Boot against the CSMS at the end of `route`, then heartbeat until
/// `shutdown` fires
pub async fn run_station(
    node: NetworkingNode,
    version: OcppVersion,
    route: SourceRouting,
    settings: Settings,
    shutdown: CancellationToken,
) {
    loop {
        if let Some(interval) = boot(&node, version, &route).await {
            settings.lock().insert(HEARTBEAT_KEY.to_string(), interval.to_string());
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(BOOT_RETRY) => {}
            _ = shutdown.cancelled() => return,
        }
    }

    loop {
        let interval = heartbeat_interval(&settings.lock());
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => return,
        }

        let options = SendOptions::default().with_cancel(shutdown.clone());
        let (ok, result) = match version {
            OcppVersion::V16 => {
                let reply = node.send::<v16::Heartbeat>(route.clone(), &v16::HeartbeatRequest {}, options).await;
                (reply.is_ok(), reply.result())
            }
            OcppVersion::V21 => {
                let reply = node.send::<v21::Heartbeat>(route.clone(), &v21::HeartbeatRequest {}, options).await;
                (reply.is_ok(), reply.result())
            }
        };
        if !ok {
            warn!("Heartbeat to {} failed: {}", route, result);
        }
    }
}

/// Heartbeat interval granted by the CSMS, if it accepted the boot
async fn boot(node: &NetworkingNode, version: OcppVersion, route: &SourceRouting) -> Option<i32> {
    let (status, interval, result) = match version {
        OcppVersion::V16 => {
            let request = v16::BootNotificationRequest::new("Elektrokombinacija", "NN-Station");
            let reply = node.send::<v16::BootNotification>(route.clone(), &request, SendOptions::default()).await;
            let result = reply.result();
            let payload = reply.into_payload();
            (payload.as_ref().map(|p| p.status), payload.map(|p| p.interval), result)
        }
        OcppVersion::V21 => {
            let request = v21::BootNotificationRequest {
                charging_station: v21::ChargingStationInfo {
                    model: "NN-Station".to_string(),
                    vendor_name: "Elektrokombinacija".to_string(),
                    serial_number: None,
                    firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
                },
                reason: v21::BootReason::PowerUp,
            };
            let reply = node.send::<v21::BootNotification>(route.clone(), &request, SendOptions::default()).await;
            let result = reply.result();
            let payload = reply.into_payload();
            (payload.as_ref().map(|p| p.status), payload.map(|p| p.interval), result)
        }
    };

    match (status, interval) {
        (Some(RegistrationStatus::Accepted), Some(interval)) => {
            info!("Boot accepted by {}, heartbeat every {}s", route, interval);
            Some(interval.max(1))
        }
        (Some(status), _) => {
            warn!("Boot {:?} by {}, retrying in {:?}", status, route, BOOT_RETRY);
            None
        }
        _ => {
            warn!("Boot to {} failed: {}, retrying in {:?}", route, result, BOOT_RETRY);
            None
        }
    }
}

fn heartbeat_interval(settings: &HashMap<String, String>) -> Duration {
    let seconds = settings
        .get(HEARTBEAT_KEY)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|seconds| *seconds > 0)
        .unwrap_or(HEARTBEAT_INTERVAL as u64);
    Duration::from_secs(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_configuration_splits_unknown_keys() {
        let settings = default_settings();
        let response = get_configuration(
            &settings.lock(),
            v16::GetConfigurationRequest {
                key: Some(vec![HEARTBEAT_KEY.to_string(), "Nope".to_string()]),
            },
        );

        let known = response.configuration_key.unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].value.as_deref(), Some("60"));
        assert_eq!(response.unknown_key, Some(vec!["Nope".to_string()]));
    }

    #[test]
    fn test_set_then_get_variable() {
        let settings = default_settings();
        let component = v21::Component::named("OCPPCommCtrlr");
        let variable = v21::Variable::named("OfflineThreshold");

        set_variables(
            &mut settings.lock(),
            v21::SetVariablesRequest {
                set_variable_data: vec![v21::SetVariableData {
                    attribute_type: None,
                    attribute_value: "30".to_string(),
                    component: component.clone(),
                    variable: variable.clone(),
                }],
            },
        );
        let response = get_variables(
            &settings.lock(),
            v21::GetVariablesRequest {
                get_variable_data: vec![v21::GetVariableData {
                    attribute_type: None,
                    component,
                    variable,
                }],
            },
        );

        let result = &response.get_variable_result[0];
        assert_eq!(result.attribute_status, v21::GetVariableStatus::Accepted);
        assert_eq!(result.attribute_value.as_deref(), Some("30"));
    }

    #[test]
    fn test_heartbeat_interval_fallback() {
        let mut settings = HashMap::new();
        assert_eq!(heartbeat_interval(&settings), Duration::from_secs(60));
        settings.insert(HEARTBEAT_KEY.to_string(), "0".to_string());
        assert_eq!(heartbeat_interval(&settings), Duration::from_secs(60));
        settings.insert(HEARTBEAT_KEY.to_string(), "15".to_string());
        assert_eq!(heartbeat_interval(&settings), Duration::from_secs(15));
    }
}
