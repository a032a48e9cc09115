//! Multi-node scenarios over the in-memory network with the OCPP catalogs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nn_adapter_ocpp::ocpp::v21::{self, Component, GetVariableData, GetVariableResult, GetVariableStatus, Variable};
use nn_adapter_ocpp::ocpp::{v16, DataTransferStatus};
use nn_adapter_ocpp::{ActionAllowList, ComponentBlocklist};
use nn_core::catalog::CatalogEntry;
use nn_core::transport::memory::MemoryNetwork;
use nn_core::wire::{self, Envelope};
use nn_core::{
    Catalog, InboxItem, LifecycleEvent, NetworkingNode, NodeBuilder, NodeConfig, NodeId, NodeRole, Payload,
    Response, ResultCode, SendOptions, SourceRouting, Transport, WireFormat,
};
use serde_json::{json, Value};

fn start(network: &MemoryNetwork, builder: NodeBuilder) -> NetworkingNode {
    let (transport, inbox) = network.join(builder.config().node_id.clone());
    let node = builder.build(Arc::new(transport)).unwrap();
    inbox.spawn(node.clone());
    node
}

fn node(id: &str, role: NodeRole) -> NodeBuilder {
    NetworkingNode::builder(NodeConfig::new(id, role), v21::catalog())
}

fn get_variables(components: &[&str]) -> v21::GetVariablesRequest {
    v21::GetVariablesRequest {
        get_variable_data: components
            .iter()
            .map(|name| GetVariableData {
                attribute_type: None,
                component: Component::named(*name),
                variable: Variable::named("Enabled"),
            })
            .collect(),
    }
}

/// Station answering every GetVariables lookup with "true"
fn answering_station(builder: NodeBuilder, calls: Arc<AtomicUsize>) -> NodeBuilder {
    builder.on::<v21::GetVariables, _, _>(move |_, request| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            Some(v21::GetVariablesResponse {
                get_variable_result: request
                    .get_variable_data
                    .into_iter()
                    .map(|data| GetVariableResult {
                        attribute_status: GetVariableStatus::Accepted,
                        attribute_status_info: None,
                        attribute_type: data.attribute_type,
                        attribute_value: Some("true".to_string()),
                        component: data.component,
                        variable: data.variable,
                    })
                    .collect(),
            })
        }
    })
}

#[tokio::test]
async fn reset_to_offline_station_is_network_error() {
    let network = MemoryNetwork::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();

    let csms = start(&network, node("csms", NodeRole::Csms));
    // Joined but never linked: offline from the CSMS point of view
    let _cs1 = start(
        &network,
        node("cs1", NodeRole::ChargingStation).on::<v21::Reset, _, _>(move |_, _| {
            handler_calls.fetch_add(1, Ordering::SeqCst);
            async {
                Some(v21::ResetResponse {
                    status: v21::ResetStatus::Accepted,
                    status_info: None,
                })
            }
        }),
    );

    let started = Instant::now();
    let reply = csms
        .send::<v21::Reset>(
            SourceRouting::to("cs1"),
            &v21::ResetRequest {
                kind: v21::ResetType::Immediate,
                evse_id: None,
            },
            SendOptions::default().with_timeout(Duration::from_secs(5)),
        )
        .await;

    assert_eq!(reply.result(), ResultCode::NetworkError);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(csms.correlation().is_empty());
}

#[tokio::test]
async fn blocked_component_is_rejected_at_relay() {
    let network = MemoryNetwork::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let csms = start(&network, node("csms", NodeRole::Csms));
    let _relay = start(
        &network,
        ComponentBlocklist::new(["SecurityCtrlr"]).install(node("relay", NodeRole::Relay)),
    );
    let _cs1 = start(&network, answering_station(node("cs1", NodeRole::ChargingStation), calls.clone()));
    network.connect("csms", "relay");
    network.connect("relay", "cs1");

    let reply = csms
        .send::<v21::GetVariables>(
            SourceRouting::via(["relay", "cs1"]),
            &get_variables(&["OCPPCommCtrlr", "SecurityCtrlr"]),
            SendOptions::default(),
        )
        .await;

    assert_eq!(reply.result(), ResultCode::Filtered);
    let payload = reply.payload.expect("rejected response payload");
    assert_eq!(payload.get_variable_result.len(), 2);
    assert!(payload
        .get_variable_result
        .iter()
        .all(|result| result.attribute_status == GetVariableStatus::Rejected));

    assert_eq!(network.delivered(&NodeId::from("cs1")), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn allowed_component_round_trips_through_relay() {
    let network = MemoryNetwork::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let filtered = Arc::new(AtomicUsize::new(0));
    let seen = filtered.clone();

    let csms = start(&network, node("csms", NodeRole::Csms));
    let _relay = start(
        &network,
        ComponentBlocklist::new(["SecurityCtrlr"])
            .install(node("relay", NodeRole::Relay))
            .subscribe(move |event| {
                if let LifecycleEvent::RequestFiltered { decision, .. } = event {
                    assert!(!decision.is_reject());
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }),
    );
    let _cs1 = start(&network, answering_station(node("cs1", NodeRole::ChargingStation), calls.clone()));
    network.connect("csms", "relay");
    network.connect("relay", "cs1");

    let reply = csms
        .send::<v21::GetVariables>(
            SourceRouting::via(["relay", "cs1"]),
            &get_variables(&["OCPPCommCtrlr"]),
            SendOptions::default(),
        )
        .await;

    assert!(reply.is_ok(), "unexpected result {}", reply.result());
    let payload = reply.payload.unwrap();
    assert_eq!(payload.get_variable_result[0].attribute_value.as_deref(), Some("true"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(filtered.load(Ordering::SeqCst), 1);
    assert_eq!(
        reply.response.network_path().nodes(),
        &[NodeId::from("cs1"), NodeId::from("relay")]
    );
}

#[tokio::test]
async fn allow_list_rejects_other_actions() {
    let network = MemoryNetwork::new();
    let csms = start(&network, node("csms", NodeRole::Csms));
    let _relay = start(
        &network,
        ActionAllowList::new(["GetVariables", "Heartbeat"]).install(node("relay", NodeRole::Relay)),
    );
    let _cs1 = start(&network, node("cs1", NodeRole::ChargingStation));
    network.connect("csms", "relay");
    network.connect("relay", "cs1");

    let reply = csms
        .send::<v21::Reset>(
            SourceRouting::via(["relay", "cs1"]),
            &v21::ResetRequest {
                kind: v21::ResetType::OnIdle,
                evse_id: None,
            },
            SendOptions::default(),
        )
        .await;

    assert_eq!(reply.result(), ResultCode::Filtered);
    assert_eq!(reply.payload.unwrap().status, v21::ResetStatus::Rejected);
    assert_eq!(network.delivered(&NodeId::from("cs1")), 0);
}

#[tokio::test]
async fn duplicate_replies_are_ignored() {
    let network = MemoryNetwork::new();
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();

    let csms = start(
        &network,
        node("csms", NodeRole::Csms).subscribe(move |event| {
            if matches!(event, LifecycleEvent::ResponseReceived { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }),
    );
    let (station, mut station_inbox) = network.join("cs1");
    network.connect("csms", "cs1");

    let sender = csms.clone();
    let call = tokio::spawn(async move {
        sender
            .send::<v21::Heartbeat>(SourceRouting::to("cs1"), &v21::HeartbeatRequest {}, SendOptions::default())
            .await
    });

    let Some(InboxItem::Frame { frame, .. }) = station_inbox.recv().await else {
        panic!("expected a request frame");
    };
    let Envelope::Request(request) = wire::decode(&frame, Duration::from_secs(30)).unwrap() else {
        panic!("expected a request");
    };
    let reply = Response::ok(&request, Payload::Json(json!({"currentTime": "2026-10-19T12:00:00Z"})))
        .relayed_by(&NodeId::from("cs1"));
    let reply_frame = wire::encode_response(&reply, WireFormat::Json, true);

    let csms_id = NodeId::from("csms");
    assert!(station.send_frame(&csms_id, reply_frame.clone()).await.is_sent());
    assert!(station.send_frame(&csms_id, reply_frame).await.is_sent());

    let result = call.await.unwrap();
    assert!(result.is_ok());
    assert!(result.payload.is_some());

    // Let the second copy reach the node
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert!(csms.correlation().is_empty());
}

#[tokio::test]
async fn binary_data_transfer_over_binary_framing() {
    let network = MemoryNetwork::new();
    let binary = |id: &str, role| {
        NetworkingNode::builder(NodeConfig::new(id, role).with_wire_format(WireFormat::Binary), v21::catalog())
    };

    let csms = start(&network, binary("csms", NodeRole::Csms));
    let _relay = start(&network, binary("relay", NodeRole::Relay));
    let _cs1 = start(
        &network,
        binary("cs1", NodeRole::ChargingStation).on::<v21::BinaryDataTransfer, _, _>(|_, request| async move {
            Some(v21::BinaryDataTransferResponse {
                status: DataTransferStatus::Accepted,
                data: request.data.iter().rev().copied().collect(),
            })
        }),
    );
    network.connect("csms", "relay");
    network.connect("relay", "cs1");

    let reply = csms
        .send::<v21::BinaryDataTransfer>(
            SourceRouting::via(["relay", "cs1"]),
            &v21::BinaryDataTransferRequest {
                vendor_id: "EK".to_string(),
                message_id: Some("firmware-chunk".to_string()),
                data: vec![1, 2, 3],
            },
            SendOptions::default(),
        )
        .await;

    assert!(reply.is_ok(), "unexpected result {}", reply.result());
    let payload = reply.payload.unwrap();
    assert_eq!(payload.status, DataTransferStatus::Accepted);
    assert_eq!(payload.data, vec![3, 2, 1]);
}

/// Every catalog operation accepts a minimal valid request and refuses it
/// once a mandatory field is dropped
#[test]
fn catalog_requests_require_mandatory_fields() {
    let cases: Vec<(Catalog, &str, Value, Option<&str>)> = vec![
        (
            v16::catalog(),
            "BootNotification",
            json!({"chargePointVendor": "EK", "chargePointModel": "EK3"}),
            Some("chargePointModel"),
        ),
        (v16::catalog(), "Heartbeat", json!({}), None),
        (v16::catalog(), "Reset", json!({"type": "Hard"}), Some("type")),
        (v16::catalog(), "GetConfiguration", json!({}), None),
        (
            v16::catalog(),
            "ChangeConfiguration",
            json!({"key": "HeartbeatInterval", "value": "60"}),
            Some("value"),
        ),
        (v16::catalog(), "DataTransfer", json!({"vendorId": "EK"}), Some("vendorId")),
        (
            v21::catalog(),
            "BootNotification",
            json!({"chargingStation": {"model": "EK3", "vendorName": "EK"}, "reason": "PowerUp"}),
            Some("reason"),
        ),
        (v21::catalog(), "Heartbeat", json!({}), None),
        (v21::catalog(), "Reset", json!({"type": "Immediate"}), Some("type")),
        (
            v21::catalog(),
            "GetVariables",
            json!({"getVariableData": [{"component": {"name": "C"}, "variable": {"name": "V"}}]}),
            Some("getVariableData"),
        ),
        (
            v21::catalog(),
            "SetVariables",
            json!({"setVariableData": [{"attributeValue": "1", "component": {"name": "C"}, "variable": {"name": "V"}}]}),
            Some("setVariableData"),
        ),
        (v21::catalog(), "DataTransfer", json!({"vendorId": "EK", "data": [1, 2]}), Some("vendorId")),
    ];

    for (catalog, action, valid, mandatory) in cases {
        let entry = catalog
            .get(action)
            .unwrap_or_else(|| panic!("{} missing from {}", action, catalog.name()));
        assert!(
            entry.check_request(&Payload::Json(valid.clone())).is_ok(),
            "{} {} rejected a valid request",
            catalog.name(),
            action
        );

        if let Some(field) = mandatory {
            let mut invalid = valid;
            invalid.as_object_mut().unwrap().remove(field);
            assert!(
                entry.check_request(&Payload::Json(invalid)).is_err(),
                "{} {} accepted a request without {}",
                catalog.name(),
                action,
                field
            );
        }
    }
}

#[test]
fn catalog_responses_require_mandatory_fields() {
    let catalog = v21::catalog();
    let entry = catalog.get("GetVariables").unwrap();

    let valid = json!({"getVariableResult": [{
        "attributeStatus": "Accepted",
        "attributeValue": "true",
        "component": {"name": "C"},
        "variable": {"name": "V"}
    }]});
    assert!(entry.check_response(&Payload::Json(valid)).is_ok());

    let missing_status = json!({"getVariableResult": [{"component": {"name": "C"}, "variable": {"name": "V"}}]});
    assert!(entry.check_response(&Payload::Json(missing_status)).is_err());
}
