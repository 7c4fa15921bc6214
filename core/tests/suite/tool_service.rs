//! `/run` pipeline tests: approval gating, schema validation, provider
//! dispatch, and the one-shot transport retry.

use std::sync::Arc;
use std::time::Duration;

use pybox_core::approval::ApprovalChannel;
use pybox_core::registry::ProviderRegistry;
use pybox_core::tool_service::ToolService;
use serde_json::Value;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::Request;
use wiremock::Respond;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_partial_json;
use wiremock::matchers::method;
use wiremock::matchers::path;

use crate::suite::common::AutoPeer;
use crate::suite::common::mount_echo_call;
use crate::suite::common::provider_spec;
use crate::suite::common::start_mock_provider;

struct Harness {
    service: ToolService,
    registry: Arc<ProviderRegistry>,
    http: reqwest::Client,
}

impl Harness {
    async fn start(approval_timeout: Option<Duration>) -> Harness {
        crate::suite::common::init_logging();
        let registry = Arc::new(ProviderRegistry::default());
        let approvals = Arc::new(ApprovalChannel::new(approval_timeout));
        let service = ToolService::bind(registry.clone(), approvals).await.unwrap();
        Harness { service, registry, http: reqwest::Client::new() }
    }

    async fn register_provider(&self, server: &MockServer) {
        self.registry.register("demo", provider_spec(server)).await;
    }

    async fn attach_peer(&self, accept: bool) -> AutoPeer {
        AutoPeer::attach(self.service.local_addr(), &self.service.secret(), accept).await
    }

    async fn run(&self, provider: &str, tool: &str, args: Value) -> Value {
        self.http
            .post(format!("{}/run", self.service.base_url()))
            .bearer_auth(self.service.secret())
            .json(&json!({"provider": provider, "tool": tool, "args": args}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accepted_call_is_invoked_exactly_once() {
    let harness = Harness::start(None).await;
    let provider = start_mock_provider().await;
    mount_echo_call(&provider).await;
    harness.register_provider(&provider).await;
    let peer = harness.attach_peer(true).await;

    let response = harness.run("demo", "echo", json!({"input": "hi"})).await;
    assert_eq!(response["ok"], json!(true));
    assert_eq!(response["result"], json!({"echoed": "hi"}));
    assert_eq!(peer.request_count(), 1);

    harness.service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_call_never_reaches_the_provider() {
    let harness = Harness::start(None).await;
    let provider = start_mock_provider().await;
    // A rejected call must cause zero invocations.
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&provider)
        .await;
    harness.register_provider(&provider).await;
    let _peer = harness.attach_peer(false).await;

    let response = harness.run("demo", "echo", json!({"input": "hi"})).await;
    assert_eq!(response["ok"], json!(false));
    assert_eq!(response["error"]["kind"], json!("approval_rejected"));

    harness.service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_approval_reports_timeout() {
    let harness = Harness::start(Some(Duration::from_millis(100))).await;
    let provider = start_mock_provider().await;
    harness.register_provider(&provider).await;

    // Attach a peer that never answers: read and drop every frame.
    let peer = AutoPeerNeverDecides::attach(&harness).await;

    let response = harness.run("demo", "echo", json!({"input": "hi"})).await;
    assert_eq!(response["ok"], json!(false));
    assert_eq!(response["error"]["kind"], json!("approval_timeout"));

    drop(peer);
    harness.service.shutdown().await;
}

struct AutoPeerNeverDecides {
    task: tokio::task::JoinHandle<()>,
}

impl AutoPeerNeverDecides {
    async fn attach(harness: &Harness) -> AutoPeerNeverDecides {
        use futures::StreamExt;
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let mut request = format!("ws://{}/approvals", harness.service.local_addr())
            .into_client_request()
            .unwrap();
        request.headers_mut().insert(
            tokio_tungstenite::tungstenite::http::header::AUTHORIZATION,
            format!("Bearer {}", harness.service.secret()).parse().unwrap(),
        );
        let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        let task = tokio::spawn(async move {
            let (_sink, mut stream) = ws.split();
            while let Some(Ok(_)) = stream.next().await {}
        });
        AutoPeerNeverDecides { task }
    }
}

impl Drop for AutoPeerNeverDecides {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_arguments_are_rejected_before_dispatch() {
    let harness = Harness::start(None).await;
    let provider = start_mock_provider().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&provider)
        .await;
    harness.register_provider(&provider).await;
    let _peer = harness.attach_peer(true).await;

    // Wrong type for `input`.
    let response = harness.run("demo", "echo", json!({"input": 5})).await;
    assert_eq!(response["ok"], json!(false));
    assert_eq!(response["error"]["kind"], json!("validation_error"));
    assert!(
        response["error"]["message"].as_str().unwrap().contains("args.input"),
        "error names the offending path: {response}"
    );

    // Missing required field.
    let response = harness.run("demo", "echo", json!({})).await;
    assert_eq!(response["error"]["kind"], json!("validation_error"));

    harness.service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_tool_and_provider_are_validation_errors() {
    let harness = Harness::start(None).await;
    let provider = start_mock_provider().await;
    harness.register_provider(&provider).await;
    let _peer = harness.attach_peer(true).await;

    let response = harness.run("demo", "not_a_tool", json!({})).await;
    assert_eq!(response["error"]["kind"], json!("validation_error"));

    let response = harness.run("ghost", "echo", json!({})).await;
    assert_eq!(response["error"]["kind"], json!("validation_error"));
    assert!(response["error"]["message"].as_str().unwrap().contains("ghost"));

    harness.service.shutdown().await;
}

/// First `tools/call` fails at the HTTP layer; the retry against a fresh
/// session must succeed, with the approval asked exactly once.
struct FlakyCallResponder;

impl Respond for FlakyCallResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        use std::sync::atomic::AtomicUsize;
        use std::sync::atomic::Ordering;
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let id = body["id"].clone();
        if CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
            ResponseTemplate::new(500)
        } else {
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"content": [{"type": "text", "text": "recovered"}]}
            }))
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_error_retries_once_without_repeating_approval() {
    let harness = Harness::start(None).await;
    let provider = start_mock_provider().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(FlakyCallResponder)
        .mount(&provider)
        .await;
    harness.register_provider(&provider).await;
    let peer = harness.attach_peer(true).await;

    let response = harness.run("demo", "echo", json!({"input": "hi"})).await;
    assert_eq!(response["ok"], json!(true), "retry must succeed: {response}");
    assert_eq!(response["result"], json!("recovered"));
    assert_eq!(peer.request_count(), 1, "approval is not repeated on retry");

    harness.service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tool_level_error_is_reported_verbatim_without_retry() {
    let harness = Harness::start(None).await;
    let provider = start_mock_provider().await;

    struct ToolErrorResponder;
    impl Respond for ToolErrorResponder {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": body["id"],
                "result": {
                    "content": [{"type": "text", "text": "echo exploded"}],
                    "isError": true
                }
            }))
        }
    }
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ToolErrorResponder)
        .expect(1)
        .mount(&provider)
        .await;
    harness.register_provider(&provider).await;
    let _peer = harness.attach_peer(true).await;

    let response = harness.run("demo", "echo", json!({"input": "hi"})).await;
    assert_eq!(response["ok"], json!(false));
    assert_eq!(response["error"]["kind"], json!("tool_error"));
    assert_eq!(response["error"]["message"], json!("echo exploded"));

    harness.service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_approval_peer_is_refused() {
    let harness = Harness::start(None).await;
    let _first = harness.attach_peer(true).await;

    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut request = format!("ws://{}/approvals", harness.service.local_addr())
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        tokio_tungstenite::tungstenite::http::header::AUTHORIZATION,
        format!("Bearer {}", harness.service.secret()).parse().unwrap(),
    );
    let err = tokio_tungstenite::connect_async(request).await.unwrap_err();
    assert!(
        matches!(err, tokio_tungstenite::tungstenite::Error::Http(ref resp) if resp.status() == 409),
        "expected HTTP 409, got {err:?}"
    );

    harness.service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deregister_during_a_call_lets_it_finish() {
    let harness = Harness::start(None).await;
    let provider = start_mock_provider().await;

    struct SlowEcho;
    impl Respond for SlowEcho {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(300))
                .set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": {"content": [{"type": "text", "text": "finished"}]}
                }))
        }
    }
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(SlowEcho)
        .mount(&provider)
        .await;
    harness.register_provider(&provider).await;
    let _peer = harness.attach_peer(true).await;

    let in_flight = {
        let http = harness.http.clone();
        let url = format!("{}/run", harness.service.base_url());
        let secret = harness.service.secret();
        tokio::spawn(async move {
            http.post(url)
                .bearer_auth(secret)
                .json(&json!({"provider": "demo", "tool": "echo", "args": {"input": "hi"}}))
                .send()
                .await
                .unwrap()
                .json::<Value>()
                .await
                .unwrap()
        })
    };

    // Give the call time to get past approval and into the provider, then
    // pull the rug.
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.registry.deregister("demo").await;

    let response = in_flight.await.unwrap();
    assert_eq!(response["ok"], json!(true));
    assert_eq!(response["result"], json!("finished"));

    // Nothing is created afterwards.
    let response = harness.run("demo", "echo", json!({"input": "hi"})).await;
    assert_eq!(response["error"]["kind"], json!("validation_error"));

    harness.service.shutdown().await;
}
