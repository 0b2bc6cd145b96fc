use super::*;
use std::net::Ipv4Addr;

use anyhow::anyhow;
use serde_json::{json, Value};

use crate::callback::{CallbackRegistry, FunctionCallback, WebhookCallback};
use crate::cert::{create_self_signed_cert, TlsMaterial};
use crate::completion::{InMemoryCompletionTracker, WaitTimeout, ROOT_CHANNEL};

fn local_identity(protocol: Protocol, tls: Option<TlsMaterial>) -> ListenerIdentity {
    ListenerIdentity {
        host: "127.0.0.1".to_string(),
        port: 0,
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        protocol,
        tls,
    }
}

fn setup_listener() -> (WebhookListener, Arc<InMemoryCompletionTracker>) {
    let tracker = Arc::new(InMemoryCompletionTracker::new());
    let listener = WebhookListener::new(local_identity(Protocol::Http, None), tracker.clone());
    (listener, tracker)
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|name| name.to_string()).collect()
}

fn failing() -> Arc<dyn WebhookCallback> {
    Arc::new(FunctionCallback::new(|job_id: &str, _payload: &Value| {
        Err(anyhow!("handler failed for {}", job_id))
    }))
}

fn noop() -> Arc<dyn WebhookCallback> {
    Arc::new(FunctionCallback::new(|_job_id: &str, _payload: &Value| Ok(())))
}

struct SlowCallback {
    delay: Duration,
}

#[async_trait::async_trait]
impl WebhookCallback for SlowCallback {
    async fn on_notification(&self, _job_id: &str, _payload: &Value) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

fn slow(delay: Duration) -> Arc<dyn WebhookCallback> {
    Arc::new(SlowCallback { delay })
}

/// Polls until the job's pending channels match `expected`, for up to five seconds.
async fn settled_pending(tracker: &InMemoryCompletionTracker, job_id: &str, expected: &[&str]) -> Vec<String> {
    for _ in 0..100 {
        if tracker.pending(job_id) == names(expected) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tracker.pending(job_id)
}

async fn deliver(listener: &WebhookListener, path: &str, body: Value) -> reqwest::StatusCode {
    let addr = listener.local_addr().expect("listener should be running");
    reqwest::Client::new()
        .post(format!("http://{}/{}", addr, path))
        .json(&body)
        .send()
        .await
        .unwrap()
        .status()
}

#[test]
fn test_protocol_parsing() {
    assert_eq!("http".parse::<Protocol>().unwrap(), Protocol::Http);
    assert_eq!("HTTPS".parse::<Protocol>().unwrap(), Protocol::Https);
    assert!(matches!("ftp".parse::<Protocol>(), Err(Error::Validation(_))));
}

#[tokio::test]
async fn test_root_webhook_signals_job() {
    let (listener, tracker) = setup_listener();
    let token = listener.start(RouteTable::default()).await.unwrap();
    assert_eq!(listener.status(), ListenerStatus::Running);

    tracker.register("job-1", &names(&[ROOT_CHANNEL]));
    let status = deliver(&listener, "job-1", json!({ "token": token })).await;

    assert_eq!(status, reqwest::StatusCode::OK);
    assert!(tracker.await_all("job-1", WaitTimeout::NoWait).await);
    listener.stop().await;
}

#[tokio::test]
async fn test_duplicate_delivery_is_a_noop() {
    let (listener, tracker) = setup_listener();
    let token = listener.start(RouteTable::default()).await.unwrap();
    tracker.register("job-1", &names(&[ROOT_CHANNEL]));

    let first = deliver(&listener, "job-1", json!({ "token": token })).await;
    let second = deliver(&listener, "job-1", json!({ "token": token })).await;

    assert_eq!(first, reqwest::StatusCode::OK);
    assert_eq!(second, reqwest::StatusCode::OK);
    assert!(tracker.await_all("job-1", WaitTimeout::Indefinite).await);
    listener.stop().await;
}

#[tokio::test]
async fn test_bad_token_mutates_nothing() {
    let (listener, tracker) = setup_listener();
    let registry = CallbackRegistry::new();
    registry.register(noop(), Some("c1")).unwrap();
    listener.start(registry.route_table()).await.unwrap();
    tracker.register("job-1", &names(&[ROOT_CHANNEL, "c1"]));

    let wrong = deliver(&listener, "job-1", json!({ "token": "forged" })).await;
    let missing = deliver(&listener, "c1/job-1", json!({ "status": "done" })).await;

    assert_eq!(wrong, reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(missing, reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(tracker.pending("job-1"), names(&[ROOT_CHANNEL, "c1"]));
    listener.stop().await;
}

#[tokio::test]
async fn test_failing_handler_still_signals() {
    let (listener, tracker) = setup_listener();
    let registry = CallbackRegistry::new();
    registry.register(failing(), Some("c1")).unwrap();
    let token = listener.start(registry.route_table()).await.unwrap();
    tracker.register("job-1", &names(&[ROOT_CHANNEL, "c1"]));

    let status = deliver(&listener, "c1/job-1", json!({ "token": token, "text": "hi" })).await;

    assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(tracker.pending("job-1"), names(&[ROOT_CHANNEL]));
    listener.stop().await;
}

#[tokio::test]
async fn test_handler_receives_payload() {
    let (listener, tracker) = setup_listener();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let callback = {
        let seen = seen.clone();
        FunctionCallback::new(move |job_id: &str, payload: &Value| {
            seen.lock().unwrap().push((job_id.to_string(), payload["text"].clone()));
            Ok(())
        })
    };
    let registry = CallbackRegistry::new();
    registry.register(Arc::new(callback), Some("c1")).unwrap();
    let token = listener.start(registry.route_table()).await.unwrap();
    tracker.register("job-1", &names(&[ROOT_CHANNEL, "c1"]));

    let status = deliver(&listener, "c1/job-1", json!({ "token": token, "text": "hello" })).await;

    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(
        seen.lock().unwrap().clone(),
        vec![("job-1".to_string(), json!("hello"))]
    );
    listener.stop().await;
}

#[tokio::test]
async fn test_restart_rotates_token_and_routes() {
    let (listener, tracker) = setup_listener();
    let registry = CallbackRegistry::new();
    registry.register(noop(), Some("c1")).unwrap();
    registry.register(noop(), Some("c2")).unwrap();
    let old_token = listener.start(registry.route_table()).await.unwrap();
    assert_eq!(listener.generation(), Some(1));

    registry.unregister(&["c1".into()]);
    let new_token = listener.restart(registry.route_table()).await.unwrap();
    assert_ne!(old_token, new_token);
    assert_eq!(listener.generation(), Some(2));

    tracker.register("job-1", &names(&[ROOT_CHANNEL, "c2"]));
    let stale = deliver(&listener, "job-1", json!({ "token": old_token })).await;
    assert_eq!(stale, reqwest::StatusCode::UNAUTHORIZED);

    let removed = deliver(&listener, "c1/job-1", json!({ "token": new_token })).await;
    assert_eq!(removed, reqwest::StatusCode::NOT_FOUND);

    let kept = deliver(&listener, "c2/job-1", json!({ "token": new_token })).await;
    assert_eq!(kept, reqwest::StatusCode::OK);
    assert_eq!(tracker.pending("job-1"), names(&[ROOT_CHANNEL]));
    listener.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (listener, _tracker) = setup_listener();
    listener.stop().await;
    listener.start(RouteTable::default()).await.unwrap();
    listener.stop().await;
    listener.stop().await;

    assert_eq!(listener.status(), ListenerStatus::Stopped);
    assert!(listener.token().is_none());
    assert!(listener.local_addr().is_none());
}

#[tokio::test]
async fn test_bind_conflict_is_reported() {
    let occupied = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let mut identity = local_identity(Protocol::Http, None);
    identity.port = port;
    let listener = WebhookListener::new(identity, Arc::new(InMemoryCompletionTracker::new()));

    let result = listener.start(RouteTable::default()).await;

    assert!(matches!(result, Err(Error::Bind { .. })));
    assert_eq!(listener.status(), ListenerStatus::Stopped);
}

#[tokio::test]
async fn test_https_without_material_fails() {
    let listener = WebhookListener::new(
        local_identity(Protocol::Https, None),
        Arc::new(InMemoryCompletionTracker::new()),
    );
    let result = listener.start(RouteTable::default()).await;
    assert!(matches!(result, Err(Error::Certificate(_))));
}

#[tokio::test]
async fn test_https_with_missing_files_fails() {
    let dir = tempfile::tempdir().unwrap();
    let listener = WebhookListener::new(
        local_identity(Protocol::Https, Some(TlsMaterial::in_dir(dir.path()))),
        Arc::new(InMemoryCompletionTracker::new()),
    );
    let result = listener.start(RouteTable::default()).await;
    assert!(matches!(result, Err(Error::Certificate(_))));
}

#[tokio::test]
async fn test_https_delivery_with_self_signed_cert() {
    let dir = tempfile::tempdir().unwrap();
    let material = TlsMaterial::in_dir(dir.path());
    create_self_signed_cert("127.0.0.1", &material).unwrap();

    let tracker = Arc::new(InMemoryCompletionTracker::new());
    let listener = WebhookListener::new(
        local_identity(Protocol::Https, Some(material)),
        tracker.clone(),
    );
    let token = listener.start(RouteTable::default()).await.unwrap();
    tracker.register("job-1", &names(&[ROOT_CHANNEL]));

    let addr = listener.local_addr().unwrap();
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let status = client
        .post(format!("https://{}/job-1", addr))
        .json(&json!({ "token": token }))
        .send()
        .await
        .unwrap()
        .status();

    assert_eq!(status, reqwest::StatusCode::OK);
    assert!(tracker.await_all("job-1", WaitTimeout::NoWait).await);
    listener.stop().await;
}

#[tokio::test]
async fn test_dropped_connection_still_signals() {
    let (listener, tracker) = setup_listener();
    let registry = CallbackRegistry::new();
    registry.register(slow(Duration::from_secs(1)), Some("c1")).unwrap();
    let token = listener.start(registry.route_table()).await.unwrap();
    tracker.register("job-1", &names(&[ROOT_CHANNEL, "c1"]));

    let addr = listener.local_addr().unwrap();
    let impatient = reqwest::Client::builder()
        .timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let result = impatient
        .post(format!("http://{}/c1/job-1", addr))
        .json(&json!({ "token": token }))
        .send()
        .await;

    assert!(result.is_err());
    assert_eq!(
        settled_pending(&tracker, "job-1", &[ROOT_CHANNEL]).await,
        names(&[ROOT_CHANNEL])
    );
    listener.stop().await;
}

#[tokio::test]
async fn test_restart_during_delivery_still_signals() {
    let tracker = Arc::new(InMemoryCompletionTracker::new());
    let listener = WebhookListener::new(local_identity(Protocol::Http, None), tracker.clone())
        .with_shutdown_grace(Duration::from_millis(50));
    let registry = CallbackRegistry::new();
    registry.register(slow(Duration::from_secs(1)), Some("c1")).unwrap();
    let token = listener.start(registry.route_table()).await.unwrap();
    tracker.register("job-1", &names(&[ROOT_CHANNEL, "c1"]));

    let url = format!("http://{}/c1/job-1", listener.local_addr().unwrap());
    let in_flight = tokio::spawn(async move {
        reqwest::Client::new()
            .post(url)
            .json(&json!({ "token": token }))
            .send()
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    listener.restart(registry.route_table()).await.unwrap();
    let _ = in_flight.await;

    assert_eq!(
        settled_pending(&tracker, "job-1", &[ROOT_CHANNEL]).await,
        names(&[ROOT_CHANNEL])
    );
    listener.stop().await;
}

#[tokio::test]
async fn test_restart_keeps_first_bound_port() {
    let (listener, tracker) = setup_listener();
    listener.start(RouteTable::default()).await.unwrap();
    let first = listener.local_addr().unwrap();
    assert_ne!(first.port(), 0);
    assert_eq!(listener.port(), first.port());

    let token = listener.restart(RouteTable::default()).await.unwrap();
    assert_eq!(listener.local_addr(), Some(first));

    tracker.register("job-1", &names(&[ROOT_CHANNEL]));
    let status = deliver(&listener, "job-1", json!({ "token": token })).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    listener.stop().await;
    assert_eq!(listener.port(), first.port());
}
