use gatehouse_pdp::EngineKind;
use gatehouse_server::{AppConfig, build_app};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use url::Url;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const API_KEY: &str = "test-api-key";

struct Harness {
    base: String,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: JoinHandle<()>,
    source: MockServer,
    _opa: MockServer,
}

impl Harness {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

fn config(source: &MockServer, opa: &MockServer) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.security.api_key = Some(API_KEY.to_string());
    cfg.pdp.policy_source.base_url = Some(Url::parse(&source.uri()).unwrap());
    cfg.pdp.engine.kind = EngineKind::Remote;
    cfg.pdp.engine.remote.url = Some(Url::parse(&opa.uri()).unwrap());
    cfg
}

async fn mount_policies(source: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/policies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "policies": [
                {"id": 1, "policyName": "document", "policyDefinition": "allow-doc", "version": 1},
                {"id": 2, "policyName": "invoice", "policyDefinition": "deny-invoice", "version": 1}
            ]
        })))
        .mount(source)
        .await;
}

async fn mount_evaluator(opa: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/data"))
        .and(body_partial_json(json!({"policy": "allow-doc"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": true})))
        .mount(opa)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/data"))
        .and(body_partial_json(json!({"policy": "deny-invoice"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": {"allow": false, "reason": "Invoices are locked"}
        })))
        .mount(opa)
        .await;
}

async fn start_server_with(cfg: AppConfig, source: MockServer, opa: MockServer) -> Harness {
    let app = build_app(&cfg).expect("build app");

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    Harness {
        base: format!("http://{addr}"),
        shutdown: tx,
        handle,
        source,
        _opa: opa,
    }
}

async fn start_server() -> Harness {
    let source = MockServer::start().await;
    let opa = MockServer::start().await;
    mount_policies(&source).await;
    mount_evaluator(&opa).await;
    let cfg = config(&source, &opa);
    start_server_with(cfg, source, opa).await
}

fn check(resource: Value) -> Value {
    json!({
        "tenantId": "t1",
        "subject": {"id": "u1", "roles": ["editor"]},
        "action": "read",
        "resource": resource
    })
}

#[tokio::test]
async fn info_and_health_endpoints() {
    let h = start_server().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/", h.base)).send().await.unwrap();
    assert!(resp.status().is_success());
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["service"], "Gatehouse");
    assert_eq!(body["status"], "ok");

    let resp = client.get(format!("{}/healthz", h.base)).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = client.get(format!("{}/readyz", h.base)).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ready");
    assert_eq!(body["engine"], "remote");
    assert_eq!(body["policySource"], "closed");
    assert!(body["policySourceStateSeconds"].as_u64().unwrap() < 60);

    h.stop().await;
}

#[tokio::test]
async fn request_id_is_echoed() {
    let h = start_server().await;
    let resp = reqwest::Client::new()
        .get(format!("{}/healthz", h.base))
        .header("x-request-id", "abc-123")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-request-id"], "abc-123");
    h.stop().await;
}

#[tokio::test]
async fn authorize_allows_and_denies() {
    let h = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/authorize", h.base))
        .json(&check(json!({"type": "document", "id": "d1"})))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["allowed"], true);
    assert_eq!(body["reason"], "Allowed by policy");

    let resp = client
        .post(format!("{}/authorize", h.base))
        .json(&check(json!("invoice")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["allowed"], false);
    assert_eq!(body["reason"], "Invoices are locked");

    // No policy named after the resource and no fallback policy
    let resp = client
        .post(format!("{}/authorize", h.base))
        .json(&check(json!({"type": "patient"})))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["allowed"], false);
    assert_eq!(body["reason"], "No applicable policy found");

    // Policies were fetched once for all three checks
    let fetches = h.source.received_requests().await.unwrap().len();
    assert_eq!(fetches, 1);

    h.stop().await;
}

#[tokio::test]
async fn authorize_rejects_invalid_requests() {
    let h = start_server().await;
    let client = reqwest::Client::new();

    let mut body = check(json!({"type": "document"}));
    body.as_object_mut().unwrap().remove("action");
    let resp = client
        .post(format!("{}/authorize", h.base))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
    assert_eq!(
        body["message"],
        "Action and resource are required for permission check."
    );

    let resp = client
        .post(format!("{}/authorize", h.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "bad_request");

    h.stop().await;
}

#[tokio::test]
async fn unavailable_policy_source_maps_to_503() {
    let source = MockServer::start().await;
    let opa = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/policies"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&source)
        .await;

    let mut cfg = config(&source, &opa);
    cfg.pdp.circuit_breaker.failure_threshold = 1;
    let h = start_server_with(cfg, source, opa).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/authorize", h.base))
        .json(&check(json!("document")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "policy_load_error");

    // Breaker is now open: rejected without touching the source
    let resp = client
        .post(format!("{}/authorize", h.base))
        .json(&check(json!("document")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("circuit breaker open"));
    assert_eq!(h.source.received_requests().await.unwrap().len(), 1);

    let resp = client.get(format!("{}/readyz", h.base)).send().await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["policySource"], "open");

    h.stop().await;
}

#[tokio::test]
async fn test_policy_endpoint() {
    let h = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/test-policy", h.base))
        .json(&json!({"policy": "allow-doc", "input": {"user": "u1"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["allow"], true);

    let resp = client
        .post(format!("{}/test-policy", h.base))
        .json(&json!({"policy": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Policy string cannot be empty for testing.");

    h.stop().await;
}

#[tokio::test]
async fn invalidate_cache_requires_api_key() {
    let h = start_server().await;
    let client = reqwest::Client::new();
    let url = format!("{}/invalidate-cache", h.base);

    let resp = client.post(&url).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Invalid or missing API Key");

    let resp = client
        .post(&url)
        .header("x-api-key", "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Warm the cache, invalidate, and check the next decision refetches
    let authorize = format!("{}/authorize", h.base);
    client
        .post(&authorize)
        .json(&check(json!("document")))
        .send()
        .await
        .unwrap();

    let resp = client
        .post(&url)
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Policy cache invalidated successfully.");

    client
        .post(&authorize)
        .json(&check(json!("document")))
        .send()
        .await
        .unwrap();
    assert_eq!(h.source.received_requests().await.unwrap().len(), 2);

    h.stop().await;
}

#[tokio::test]
async fn invalidate_cache_refused_without_configured_key() {
    let source = MockServer::start().await;
    let opa = MockServer::start().await;
    let mut cfg = config(&source, &opa);
    cfg.security.api_key = None;
    let h = start_server_with(cfg, source, opa).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/invalidate-cache", h.base))
        .header("x-api-key", "anything")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    h.stop().await;
}

#[tokio::test]
async fn shared_secret_guards_decision_routes() {
    let source = MockServer::start().await;
    let opa = MockServer::start().await;
    mount_policies(&source).await;
    mount_evaluator(&opa).await;
    let mut cfg = config(&source, &opa);
    cfg.security.shared_secret = Some("s3cret".to_string());
    let h = start_server_with(cfg, source, opa).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/authorize", h.base))
        .json(&check(json!("document")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Unauthorized: Invalid shared secret.");

    let resp = client
        .post(format!("{}/test-policy", h.base))
        .header("x-shared-secret", "nope")
        .json(&json!({"policy": "allow-doc"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(format!("{}/authorize", h.base))
        .header("x-shared-secret", "s3cret")
        .json(&check(json!("document")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Health stays open
    let resp = client.get(format!("{}/healthz", h.base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    h.stop().await;
}
