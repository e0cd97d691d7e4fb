// HTTP transport tests
//
// Exercise the reqwest-backed transport against a local mock server, then run
// a full login and protected call through it.

use mockito::{Matcher, Server};
use serde_json::{json, Value};
use std::sync::Arc;

use booking_session::{
    auth::{LoginCredentials, SessionManager, SessionState, LOGIN_PATH, PROFILE_PATH},
    broadcast::LocalBroadcastHub,
    client::ApiClient,
    dispatcher::{DispatcherConfig, RequestDispatcher},
    store::LocalCredentialStore,
    transport::{HttpTransport, Transport, TransportOutcome, TransportRequest},
};

fn transport(server: &Server) -> HttpTransport {
    HttpTransport::new(&server.url(), 4, 5, 5).unwrap()
}

// ==================================================================================================
// Status Mapping Tests
// ==================================================================================================

#[tokio::test]
async fn test_success_returns_json_body() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/bookings")
        .match_header("authorization", "Token abc123")
        .match_header("accept", "application/json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"items":[{"id":1}]}"#)
        .create_async()
        .await;

    let outcome = transport(&server)
        .send(TransportRequest::get("/bookings").with_header("Authorization", "Token abc123"))
        .await;

    assert_eq!(outcome, TransportOutcome::Ok(json!({"items": [{"id": 1}]})));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_json_body_is_sent() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/bookings")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Json(json!({"room": 12, "nights": 3})))
        .with_status(201)
        .with_body(r#"{"id":99}"#)
        .create_async()
        .await;

    let outcome = transport(&server)
        .send(TransportRequest::post("/bookings").with_json(json!({"room": 12, "nights": 3})))
        .await;

    assert_eq!(outcome, TransportOutcome::Ok(json!({"id": 99})));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_401_is_unauthorized() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/auth/profile")
        .with_status(401)
        .with_body(r#"{"error":"token expired"}"#)
        .create_async()
        .await;

    let outcome = transport(&server)
        .send(TransportRequest::get("/auth/profile"))
        .await;
    assert_eq!(outcome, TransportOutcome::Unauthorized);
}

#[tokio::test]
async fn test_error_status_keeps_body() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/bookings")
        .with_status(503)
        .with_body("down for maintenance")
        .create_async()
        .await;

    let outcome = transport(&server).send(TransportRequest::get("/bookings")).await;
    assert_eq!(
        outcome,
        TransportOutcome::ServerError {
            status: 503,
            message: "down for maintenance".to_string(),
        }
    );
}

#[tokio::test]
async fn test_empty_body_is_null() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/auth/logout")
        .with_status(204)
        .create_async()
        .await;

    let outcome = transport(&server)
        .send(TransportRequest::post("/auth/logout"))
        .await;
    assert_eq!(outcome, TransportOutcome::Ok(Value::Null));
}

#[tokio::test]
async fn test_non_json_success_is_server_error() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/bookings")
        .with_status(200)
        .with_body("<html>proxy login</html>")
        .create_async()
        .await;

    let outcome = transport(&server).send(TransportRequest::get("/bookings")).await;
    assert!(matches!(
        outcome,
        TransportOutcome::ServerError { status: 200, .. }
    ));
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    let transport = HttpTransport::new("http://127.0.0.1:1", 4, 1, 1).unwrap();

    let outcome = transport.send(TransportRequest::get("/bookings")).await;
    assert!(matches!(outcome, TransportOutcome::NetworkError(_)));
}

// ==================================================================================================
// End-to-End Tests
// ==================================================================================================

#[tokio::test]
async fn test_login_and_protected_call_over_http() {
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", LOGIN_PATH)
        .match_body(Matcher::Json(json!({
            "username": "ada@example.com",
            "password": "correct horse"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "accessToken": "f3a9c2d1e0b7",
                "refreshToken": "r-1",
                "user": {"id": 42, "name": "Ada Lovelace"}
            })
            .to_string(),
        )
        .create_async()
        .await;
    let bookings = server
        .mock("GET", "/bookings")
        .match_header("authorization", "Token f3a9c2d1e0b7")
        .with_status(200)
        .with_body(r#"[{"id":7,"room":12}]"#)
        .expect(1)
        .create_async()
        .await;
    let profile = server
        .mock("GET", PROFILE_PATH)
        .expect(0)
        .create_async()
        .await;

    let hub = LocalBroadcastHub::new();
    let session = SessionManager::new(
        Arc::new(LocalCredentialStore::in_memory()),
        Arc::new(hub.channel()),
        Arc::new(transport(&server)),
    );
    let client = ApiClient::new(
        session.clone(),
        RequestDispatcher::new(DispatcherConfig::default()),
    );

    let user = session
        .login(&LoginCredentials::new("ada@example.com", "correct horse"))
        .await
        .unwrap();
    assert_eq!(user.id, "42");
    assert_eq!(session.state(), SessionState::Authenticated);

    let value = client.get("/bookings").await.unwrap();
    assert_eq!(value, json!([{"id": 7, "room": 12}]));

    login.assert_async().await;
    bookings.assert_async().await;
    profile.assert_async().await;
}
