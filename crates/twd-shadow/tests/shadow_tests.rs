// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shadow replica tests: snapshot, event patching, deletions, resync.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use twd_bus::{BusMessage, element_update_topic};
use twd_resilience::CircuitBreaker;
use twd_shadow::{ShadowConfig, ShadowManager};
use twd_twin::{TwinClient, TwinConfig};
use twd_types::b64url_encode;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const AAS_ID: &str = "urn:example:aas:pump-001";
const SM_ID: &str = "urn:example:submodel:pump";

async fn mock_twin(server: &MockServer, temperature: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/shells/{}", b64url_encode(AAS_ID))))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": AAS_ID,
            "idShort": "Pump001"
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/shells/{}/submodel-refs", b64url_encode(AAS_ID))))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [{"keys": [{"type": "Submodel", "value": SM_ID}]}]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/submodels/{}", b64url_encode(SM_ID))))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": SM_ID,
            "idShort": "PumpControl",
            "submodelElements": [
                {
                    "modelType": "Property",
                    "idShort": "Temperature",
                    "valueType": "xs:double",
                    "value": temperature
                },
                {
                    "modelType": "Operation",
                    "idShort": "SetSpeed",
                    "qualifiers": [{"type": "RiskLevel", "value": "HIGH"}]
                }
            ]
        })))
        .mount(server)
        .await;
}

fn shadow_for(server: &MockServer) -> Arc<ShadowManager> {
    let twin = Arc::new(
        TwinClient::new(
            TwinConfig {
                aas_base_url: server.uri(),
                submodel_base_url: None,
                timeout: Duration::from_secs(5),
            },
            Arc::new(CircuitBreaker::default()),
        )
        .unwrap(),
    );
    Arc::new(ShadowManager::new(
        twin,
        ShadowConfig {
            aas_id: AAS_ID.into(),
            aas_repo_id: "default".into(),
            submodel_repo_id: None,
        },
    ))
}

#[tokio::test]
async fn snapshot_populates_the_replica() {
    let server = MockServer::start().await;
    mock_twin(&server, "72.5").await;
    let shadow = shadow_for(&server);
    shadow.full_sync().await.unwrap();

    assert_eq!(
        shadow.get_property_value(SM_ID, "Temperature").await,
        Some(json!("72.5"))
    );
    let ops = shadow.get_operations().await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].path, "SetSpeed");
    assert!(shadow.freshness_seconds().await < 5.0);
    assert!(shadow.submodel_freshness(SM_ID).await < 5.0);
    assert_eq!(shadow.submodel_freshness("urn:unknown").await, f64::INFINITY);
}

#[tokio::test]
async fn element_event_patches_in_place_and_stamps_freshness() {
    let server = MockServer::start().await;
    mock_twin(&server, "72.5").await;
    let shadow = shadow_for(&server);
    shadow.full_sync().await.unwrap();

    shadow
        .handle_bus_message(&BusMessage {
            topic: element_update_topic("default", SM_ID, "Temperature"),
            payload: json!({
                "modelType": "Property",
                "idShort": "Temperature",
                "valueType": "xs:double",
                "value": "99.9"
            })
            .to_string()
            .into_bytes(),
        })
        .await;

    assert_eq!(
        shadow.get_property_value(SM_ID, "Temperature").await,
        Some(json!("99.9"))
    );
    assert_eq!(shadow.event_count(), 1);
    assert!(shadow.submodel_freshness(SM_ID).await < 1.0);
}

#[tokio::test]
async fn whole_submodel_update_replaces_the_body() {
    let server = MockServer::start().await;
    mock_twin(&server, "72.5").await;
    let shadow = shadow_for(&server);
    shadow.full_sync().await.unwrap();

    let topic = format!(
        "submodel-repository/default/submodels/{}/updated",
        b64url_encode(SM_ID)
    );
    shadow
        .handle_bus_message(&BusMessage {
            topic,
            payload: json!({
                "id": SM_ID,
                "submodelElements": [
                    {"modelType": "Property", "idShort": "Mode", "value": "AUTO"}
                ]
            })
            .to_string()
            .into_bytes(),
        })
        .await;

    assert_eq!(shadow.get_property_value(SM_ID, "Mode").await, Some(json!("AUTO")));
    assert_eq!(shadow.get_property_value(SM_ID, "Temperature").await, None);
}

#[tokio::test]
async fn deletion_drops_submodel_and_freshness_entry() {
    let server = MockServer::start().await;
    mock_twin(&server, "72.5").await;
    let shadow = shadow_for(&server);
    shadow.full_sync().await.unwrap();

    let topic = format!(
        "submodel-repository/default/submodels/{}/deleted",
        b64url_encode(SM_ID)
    );
    shadow
        .handle_bus_message(&BusMessage {
            topic,
            payload: Vec::new(),
        })
        .await;

    assert!(shadow.get_submodel(SM_ID).await.is_none());
    assert_eq!(shadow.submodel_freshness(SM_ID).await, f64::INFINITY);
}

#[tokio::test]
async fn foreign_repo_events_are_ignored() {
    let server = MockServer::start().await;
    mock_twin(&server, "72.5").await;
    let shadow = shadow_for(&server);
    shadow.full_sync().await.unwrap();

    shadow
        .handle_bus_message(&BusMessage {
            topic: element_update_topic("other-repo", SM_ID, "Temperature"),
            payload: json!({
                "modelType": "Property",
                "idShort": "Temperature",
                "value": "0"
            })
            .to_string()
            .into_bytes(),
        })
        .await;

    assert_eq!(shadow.event_count(), 0);
    assert_eq!(
        shadow.get_property_value(SM_ID, "Temperature").await,
        Some(json!("72.5"))
    );
}

#[tokio::test]
async fn broken_payload_triggers_resync() {
    let server = MockServer::start().await;
    mock_twin(&server, "72.5").await;
    let shadow = shadow_for(&server);
    shadow.full_sync().await.unwrap();

    // Reconfigure the twin to report a new value, then feed garbage; the
    // failed patch must fall back to a fresh snapshot.
    server.reset().await;
    mock_twin(&server, "88.8").await;

    shadow
        .handle_bus_message(&BusMessage {
            topic: element_update_topic("default", SM_ID, "Temperature"),
            payload: b"{not json".to_vec(),
        })
        .await;

    assert_eq!(
        shadow.get_property_value(SM_ID, "Temperature").await,
        Some(json!("88.8"))
    );
}

#[tokio::test]
async fn unknown_element_path_triggers_resync() {
    let server = MockServer::start().await;
    mock_twin(&server, "72.5").await;
    let shadow = shadow_for(&server);
    shadow.full_sync().await.unwrap();

    server.reset().await;
    mock_twin(&server, "55.5").await;

    shadow
        .handle_bus_message(&BusMessage {
            topic: element_update_topic("default", SM_ID, "Ghost/Path"),
            payload: json!({
                "modelType": "Property",
                "idShort": "Path",
                "value": "1"
            })
            .to_string()
            .into_bytes(),
        })
        .await;

    assert_eq!(
        shadow.get_property_value(SM_ID, "Temperature").await,
        Some(json!("55.5"))
    );
}

#[tokio::test]
async fn shell_update_overwrites_the_shell() {
    let server = MockServer::start().await;
    mock_twin(&server, "72.5").await;
    let shadow = shadow_for(&server);
    shadow.full_sync().await.unwrap();

    let topic = format!(
        "aas-repository/default/shells/{}/updated",
        b64url_encode(AAS_ID)
    );
    shadow
        .handle_bus_message(&BusMessage {
            topic,
            payload: json!({"id": AAS_ID, "idShort": "Pump001-Renamed"})
                .to_string()
                .into_bytes(),
        })
        .await;

    let shell = shadow.get_shell().await.unwrap();
    assert_eq!(shell.id_short.as_deref(), Some("Pump001-Renamed"));
}
