use super::*;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn cloud_config() -> CloudConfig {
    CloudConfig {
        project: "p".to_string(),
        network: "net".to_string(),
        zone: "z".to_string(),
        url_map: "um".to_string(),
    }
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "test-token",
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .mount(server)
        .await;
}

async fn cloud(server: &MockServer) -> GceCloud {
    mount_token(server).await;
    let token_url = format!("{}/token", server.uri());
    GceCloud::with_endpoints(&cloud_config(), &server.uri(), &token_url).unwrap()
}

fn done_op(name: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "name": name,
        "status": "DONE"
    }))
}

#[tokio::test]
async fn test_create_network_endpoint_group() {
    let server = MockServer::start().await;
    let cloud = cloud(&server).await;

    Mock::given(method("POST"))
        .and(path("/projects/p/zones/z/networkEndpointGroups"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(serde_json::json!({
            "name": "neg-cdn-none-api-example-com",
            "networkEndpointType": "GCE_VM_IP_PORT",
            "defaultPort": 80,
            "network": format!("{}/projects/p/global/networks/net", server.uri())
        })))
        .respond_with(done_op("op-neg"))
        .expect(1)
        .mount(&server)
        .await;

    cloud
        .create_network_endpoint_group("neg-cdn-none-api-example-com")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_conflict_on_create_is_success() {
    let server = MockServer::start().await;
    let cloud = cloud(&server).await;

    Mock::given(method("POST"))
        .and(path("/projects/p/zones/z/networkEndpointGroups"))
        .respond_with(ResponseTemplate::new(409).set_body_string("already exists"))
        .mount(&server)
        .await;

    cloud.create_network_endpoint_group("neg-x").await.unwrap();
}

#[tokio::test]
async fn test_denied_create_surfaces_status_and_body() {
    let server = MockServer::start().await;
    let cloud = cloud(&server).await;

    Mock::given(method("POST"))
        .and(path("/projects/p/zones/z/networkEndpointGroups"))
        .respond_with(ResponseTemplate::new(403).set_body_string("quota exceeded"))
        .mount(&server)
        .await;

    let err = cloud.create_network_endpoint_group("neg-x").await.unwrap_err();
    match err {
        DaemonError::CloudApi { status, body, .. } => {
            assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
            assert_eq!(body, "quota exceeded");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_pending_operation_is_polled_to_done() {
    let server = MockServer::start().await;
    let cloud = cloud(&server).await;

    Mock::given(method("POST"))
        .and(path("/projects/p/zones/z/networkEndpointGroups"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "op-pending",
            "status": "RUNNING"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/projects/p/zones/z/operations/op-pending"))
        .respond_with(done_op("op-pending"))
        .expect(1)
        .mount(&server)
        .await;

    cloud.create_network_endpoint_group("neg-x").await.unwrap();
}

#[tokio::test]
async fn test_operation_finishing_with_error_payload_fails() {
    let server = MockServer::start().await;
    let cloud = cloud(&server).await;

    Mock::given(method("POST"))
        .and(path("/projects/p/global/backendServices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "op-bs",
            "status": "DONE",
            "error": { "errors": [ { "message": "backend quota exhausted" } ] }
        })))
        .mount(&server)
        .await;

    let err = cloud
        .create_backend_service("bs-x", "neg-x", "hc-x", Affinity::None, false)
        .await
        .unwrap_err();
    match err {
        DaemonError::OperationFailed { name, message } => {
            assert_eq!(name, "op-bs");
            assert_eq!(message, "backend quota exhausted");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_health_check_defaults_to_root_path() {
    let server = MockServer::start().await;
    let cloud = cloud(&server).await;

    Mock::given(method("POST"))
        .and(path("/projects/p/global/healthChecks"))
        .and(body_partial_json(serde_json::json!({
            "name": "hc-x",
            "type": "HTTP",
            "httpHealthCheck": {
                "portSpecification": "USE_SERVING_PORT",
                "requestPath": "/"
            },
            "timeoutSec": 5,
            "checkIntervalSec": 10,
            "healthyThreshold": 2,
            "unhealthyThreshold": 3
        })))
        .respond_with(done_op("op-hc"))
        .expect(1)
        .mount(&server)
        .await;

    cloud.create_health_check("hc-x", "").await.unwrap();
}

#[tokio::test]
async fn test_backend_service_carries_affinity_and_cdn() {
    let server = MockServer::start().await;
    let cloud = cloud(&server).await;

    Mock::given(method("POST"))
        .and(path("/projects/p/global/backendServices"))
        .and(body_partial_json(serde_json::json!({
            "name": "bs-x",
            "backends": [{
                "group": format!("{}/projects/p/zones/z/networkEndpointGroups/neg-x", server.uri()),
                "balancingMode": "RATE",
                "maxRatePerEndpoint": 10000
            }],
            "healthChecks": [format!("{}/projects/p/global/healthChecks/hc-x", server.uri())],
            "enableCDN": false,
            "sessionAffinity": "CLIENT_IP"
        })))
        .respond_with(done_op("op-bs"))
        .expect(1)
        .mount(&server)
        .await;

    cloud
        .create_backend_service("bs-x", "neg-x", "hc-x", Affinity::ClientIp, false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_attach_endpoints_payload() {
    let server = MockServer::start().await;
    let cloud = cloud(&server).await;

    Mock::given(method("POST"))
        .and(path(
            "/projects/p/zones/z/networkEndpointGroups/neg-x/attachNetworkEndpoints",
        ))
        .and(body_partial_json(serde_json::json!({
            "networkEndpoints": [
                { "instance": "n1", "ipAddress": "10.0.0.1", "port": 8080 }
            ]
        })))
        .respond_with(done_op("op-attach"))
        .expect(1)
        .mount(&server)
        .await;

    let endpoints = vec![NetworkEndpoint::from_instance(
        "n1.c.proj.internal",
        "10.0.0.1",
        "8080",
    )];
    cloud.attach_endpoints("neg-x", &endpoints).await.unwrap();
}

#[tokio::test]
async fn test_non_numeric_port_is_rejected_before_the_wire() {
    let server = MockServer::start().await;
    let cloud = cloud(&server).await;

    let endpoints = vec![NetworkEndpoint::from_instance("n1", "10.0.0.1", "http")];
    let err = cloud.detach_endpoints("neg-x", &endpoints).await.unwrap_err();
    assert!(matches!(err, DaemonError::EndpointPort { .. }));
}

#[tokio::test]
async fn test_update_url_map_commits_new_route() {
    let server = MockServer::start().await;
    let cloud = cloud(&server).await;

    Mock::given(method("GET"))
        .and(path("/projects/p/global/urlMaps/um"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "um",
            "defaultService": "bs-default-link",
            "fingerprint": "f1"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/projects/p/global/backendServices/bs-x"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "selfLink": "bs-x-link"
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/projects/p/global/urlMaps/um"))
        .and(body_partial_json(serde_json::json!({
            "name": "um",
            "fingerprint": "f1",
            "hostRules": [ { "hosts": ["api.example.com"], "pathMatcher": "api" } ],
            "pathMatchers": [ {
                "name": "api",
                "defaultService": "bs-default-link",
                "pathRules": [ { "paths": ["/v1", "/v1/*"], "service": "bs-x-link" } ]
            } ]
        })))
        .respond_with(done_op("op-um"))
        .expect(1)
        .mount(&server)
        .await;

    cloud
        .update_url_map("um", "bs-x", "api.example.com", "/v1")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_update_url_map_is_a_no_op_when_route_exists() {
    let server = MockServer::start().await;
    let cloud = cloud(&server).await;

    Mock::given(method("GET"))
        .and(path("/projects/p/global/urlMaps/um"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "um",
            "defaultService": "bs-default-link",
            "hostRules": [ { "hosts": ["api.example.com"], "pathMatcher": "api" } ],
            "pathMatchers": [ {
                "name": "api",
                "defaultService": "bs-default-link",
                "pathRules": [ { "paths": ["/v1", "/v1/*"], "service": "bs-x-link" } ]
            } ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/projects/p/global/backendServices/bs-x"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "selfLink": "bs-x-link"
        })))
        .mount(&server)
        .await;
    // No PUT is mounted; an attempted write would fail the call.

    cloud
        .update_url_map("um", "bs-x", "api.example.com", "/v1")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_access_token_is_cached_across_calls() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "test-token",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;
    let token_url = format!("{}/token", server.uri());
    let cloud = GceCloud::with_endpoints(&cloud_config(), &server.uri(), &token_url).unwrap();

    Mock::given(method("POST"))
        .and(path("/projects/p/zones/z/networkEndpointGroups"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    cloud.create_network_endpoint_group("neg-a").await.unwrap();
    cloud.create_network_endpoint_group("neg-b").await.unwrap();
}
