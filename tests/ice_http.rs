use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use url::Url;

use peercall::config::DEFAULT_STUN_URL;
use peercall::peer::ice::{CredentialSource, HttpCredentialSource, IceResolver, SignalingCredentialSource};
use peercall::peer::types::{IceServer, IceServerSet};
use peercall::session::Session;
use peercall::signaling::{LoopbackRelay, SignalingAdapter};
use peercall::CallError;

async fn turn_credentials(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    if params.get("apiKey").map(String::as_str) != Some("secret") {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"})));
    }
    (
        StatusCode::OK,
        Json(json!([
            {"urls": "stun.example.org:19302"},
            {"urls": "relay.example.org:3478", "username": "1700000000:u", "credential": "c"}
        ])),
    )
}

async fn serve() -> SocketAddr {
    let app = Router::new()
        .route("/turn", get(turn_credentials))
        .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route("/garbage", get(|| async { "not json" }))
        .route("/empty", get(|| async { Json(json!([])) }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn endpoint(addr: SocketAddr, path: &str) -> Url {
    Url::parse(&format!("http://{addr}{path}")).unwrap()
}

fn resolver(source: HttpCredentialSource) -> IceResolver {
    IceResolver::new(Some(Arc::new(source)), Duration::from_secs(5), DEFAULT_STUN_URL)
}

#[tokio::test]
async fn credentials_are_fetched_with_the_api_key() {
    let addr = serve().await;
    let source = HttpCredentialSource::new(endpoint(addr, "/turn"), Some("secret".into()));
    let servers = source.fetch().await.unwrap();

    assert!(servers.has_relay());
    assert_eq!(servers.servers()[0].urls, vec!["stun:stun.example.org:19302"]);
    assert_eq!(servers.servers()[1].urls, vec!["turn:relay.example.org:3478"]);
    assert!(servers.servers()[1].has_credentials());
}

#[tokio::test]
async fn wrong_key_is_an_error_and_resolves_to_stun() {
    let addr = serve().await;
    let source = HttpCredentialSource::new(endpoint(addr, "/turn"), Some("nope".into()));
    assert!(matches!(source.fetch().await, Err(CallError::IceConfig(_))));

    let source = HttpCredentialSource::new(endpoint(addr, "/turn"), Some("nope".into()));
    assert_eq!(resolver(source).resolve().await, IceServerSet::stun_only(DEFAULT_STUN_URL));
}

#[tokio::test]
async fn server_errors_and_bad_bodies_fall_back() {
    let addr = serve().await;
    for path in ["/broken", "/garbage", "/empty"] {
        let source = HttpCredentialSource::new(endpoint(addr, path), None);
        assert_eq!(
            resolver(source).resolve().await,
            IceServerSet::stun_only(DEFAULT_STUN_URL),
            "{path}"
        );
    }
}

#[tokio::test]
async fn relay_answers_credential_requests_over_signaling() {
    let servers = IceServerSet::new(vec![IceServer {
        urls: vec!["turn:relay.example.org:3478".into()],
        username: Some("u".into()),
        credential: Some("c".into()),
    }]);
    let relay = LoopbackRelay::new().with_turn_servers(servers.clone());
    let session = Session::new("room", true);
    let adapter = SignalingAdapter::new(Arc::new(relay.endpoint(session.local_id())), &session);

    let source = SignalingCredentialSource::new(adapter);
    let resolved = IceResolver::new(Some(Arc::new(source)), Duration::from_secs(5), DEFAULT_STUN_URL)
        .resolve()
        .await;
    assert_eq!(resolved, servers);
}
