// Integration tests for the cloud transport using wiremock.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use intellifire::{CloudAuth, CloudTransport, FireplaceError};

const SERIAL: &str = "FP001122";

fn credentials() -> CloudAuth {
    CloudAuth::Credentials {
        username: "you@example.com".to_string(),
        password: "secret".to_string(),
    }
}

fn cookies() -> CloudAuth {
    CloudAuth::Cookies {
        user: "user123".to_string(),
        auth_cookie: "cafe".to_string(),
        web_client_id: "web1".to_string(),
    }
}

async fn transport(server: &MockServer, auth: CloudAuth) -> CloudTransport {
    CloudTransport::with_base_url(auth, server.uri()).unwrap()
}

// ── Login ───────────────────────────────────────────────────────────

#[tokio::test]
async fn login_posts_credentials_as_form() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/a//login"))
        .and(body_string("username=you%40example.com&password=secret"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Set-Cookie", "user=user123; Path=/"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let cloud = transport(&server, credentials()).await;
    cloud.login().await.unwrap();

    assert_eq!(cloud.user_id().as_deref(), Some("user123"));
}

#[tokio::test]
async fn rejected_credentials_are_an_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/a//login"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let cloud = transport(&server, credentials()).await;
    let result = cloud.login().await;

    assert!(
        matches!(result, Err(FireplaceError::Auth(_))),
        "expected Auth error, got: {result:?}"
    );
}

#[test]
fn missing_username_fails_at_construction() {
    let result = CloudTransport::new(CloudAuth::Credentials {
        username: String::new(),
        password: "secret".to_string(),
    });
    assert!(matches!(result, Err(FireplaceError::Auth(_))));
}

#[tokio::test]
async fn cookie_auth_skips_the_login_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a//enumlocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "locations": [] })))
        .mount(&server)
        .await;

    let cloud = transport(&server, cookies()).await;
    cloud.login().await.unwrap();
    assert!(cloud.ping().await);
    assert_eq!(cloud.user_id().as_deref(), Some("user123"));

    // No POST /a//login ever hit the server
    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| r.url.path() != "/a//login"));
}

// ── Connectivity ────────────────────────────────────────────────────

#[tokio::test]
async fn successful_probe_emits_one_connected_transition() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a//enumlocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "locations": [] })))
        .mount(&server)
        .await;

    let cloud = transport(&server, cookies()).await;
    let mut connectivity = cloud.subscribe_connectivity();
    assert!(!*connectivity.borrow_and_update());

    cloud.login().await.unwrap();
    assert!(cloud.ping().await);
    assert!(cloud.is_connected());
    assert!(*connectivity.borrow_and_update());

    // A second identical probe produces no further transition
    assert!(cloud.ping().await);
    assert!(!connectivity.has_changed().unwrap());
}

#[tokio::test]
async fn failed_probe_marks_disconnected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a//enumlocations"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let cloud = transport(&server, cookies()).await;
    cloud.login().await.unwrap();

    assert!(!cloud.ping().await);
    assert!(!cloud.is_connected());
}

#[tokio::test]
async fn session_task_connects_on_its_own() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a//enumlocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "locations": [] })))
        .mount(&server)
        .await;

    let mut cloud = transport(&server, cookies()).await;
    let mut connectivity = cloud.subscribe_connectivity();
    cloud.start();

    tokio::time::timeout(
        Duration::from_secs(5),
        connectivity.wait_for(|connected| *connected),
    )
    .await
    .expect("session task never connected")
    .unwrap();

    cloud.stop().await;
}

// ── Enumeration ─────────────────────────────────────────────────────

#[tokio::test]
async fn devices_walks_locations_then_fireplaces() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a//enumlocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "locations": [{ "location_id": "loc1", "fireplaces": [] }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/a//enumfireplaces"))
        .and(query_param("location_id", "loc1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "location_id": "loc1",
            "fireplaces": [{
                "name": "Living Room",
                "serial": SERIAL,
                "brand": "H&H",
                "apikey": "8824ff0cd66e87c28eb8f16e4e4f3a81"
            }]
        })))
        .mount(&server)
        .await;

    let cloud = transport(&server, cookies()).await;
    cloud.login().await.unwrap();
    let devices = cloud.devices().await.unwrap();

    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].serial, SERIAL);
    assert_eq!(devices[0].name, "Living Room");
    assert!(devices[0].apikey.is_some());
}

// ── Polling ─────────────────────────────────────────────────────────

#[tokio::test]
async fn status_decodes_a_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/a/{SERIAL}/apppoll")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "power": "1",
            "height": "2",
            "fanspeed": "0",
            "light": "1",
            "timestamp": 1700000000,
        })))
        .mount(&server)
        .await;

    let cloud = transport(&server, cookies()).await;
    let state = cloud.status(SERIAL).await.unwrap();

    assert!(state.power);
    assert!(state.ack_power);
    assert_eq!(state.height, 2);
    assert!(state.light);
}

#[tokio::test]
async fn long_poll_carries_the_etag_forward() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/a/{SERIAL}/applongpoll")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "754:0")
                .set_body_json(json!({ "power": "1", "height": "3" })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/a/{SERIAL}/applongpoll")))
        .and(header("If-None-Match", "754:0"))
        .respond_with(ResponseTemplate::new(304).insert_header("ETag", "754:0"))
        .mount(&server)
        .await;

    let cloud = transport(&server, cookies()).await;

    let (state, etag) = cloud.poll(SERIAL, None).await.unwrap();
    assert!(state.is_some());
    assert_eq!(etag.as_deref(), Some("754:0"));

    // Reusing the validator short-circuits with "no change"
    let (state, etag) = cloud.poll(SERIAL, etag.as_deref()).await.unwrap();
    assert!(state.is_none());
    assert_eq!(etag.as_deref(), Some("754:0"));
}

#[tokio::test]
async fn malformed_poll_body_is_an_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/a/{SERIAL}/applongpoll")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "height": "3" })))
        .mount(&server)
        .await;

    let cloud = transport(&server, cookies()).await;
    let result = cloud.poll(SERIAL, None).await;

    assert!(matches!(result, Err(FireplaceError::InvalidResponse(_))));
}

// ── Commands ────────────────────────────────────────────────────────

#[tokio::test]
async fn post_form_encodes_the_setting() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/a/{SERIAL}/apppost")))
        .and(body_string("power=1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let cloud = transport(&server, cookies()).await;
    cloud.post(SERIAL, "power", "1").await.unwrap();
}

#[tokio::test]
async fn failed_post_reports_the_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/a/{SERIAL}/apppost")))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let cloud = transport(&server, cookies()).await;
    let result = cloud.post(SERIAL, "power", "1").await;

    assert!(matches!(result, Err(FireplaceError::CloudStatus(_))));
}
