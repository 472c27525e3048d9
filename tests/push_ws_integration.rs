//! Integration tests for the push WebSocket + scan REST surface.
//!
//! Each test spins up an Axum server on a random port with a stub worker,
//! connects via tokio-tungstenite, and exercises the real WS / REST contract.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use lanscan::config::CoordinatorConfig;
use lanscan::devices::{DeviceSnapshot, MacAddress};
use lanscan::error::TransportError;
use lanscan::events::{EventBus, PushEvent, Topic};
use lanscan::identity::{Principal, Role};
use lanscan::scans::{ScanCoordinator, ScanStatus};
use lanscan::session::{ClientSession, HttpStateSource, ReconnectPolicy, SessionNotice, WsTransport};
use lanscan::store::MemoryStore;
use lanscan::worker::{ScanReport, WorkerChannel, WorkerCommand, WorkerEventStream};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Accepts every command and remembers it.
#[derive(Default)]
struct StubWorker {
    sent: Mutex<Vec<WorkerCommand>>,
}

#[async_trait]
impl WorkerChannel for StubWorker {
    async fn send_command(&self, command: &WorkerCommand) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(command.clone());
        Ok(())
    }

    async fn events(&self) -> Result<WorkerEventStream, TransportError> {
        Err(TransportError::StreamTaken)
    }

    fn is_connected(&self) -> bool {
        true
    }
}

struct TestServer {
    port: u16,
    coordinator: Arc<ScanCoordinator>,
    bus: EventBus,
    worker: Arc<StubWorker>,
}

impl TestServer {
    fn http(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    /// Wait until `n` push clients have subscribed to `topic`.
    async fn wait_for_subscribers(&self, topic: Topic, n: usize) {
        while self.bus.subscribers_for(topic) < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Start an Axum server on a random port.
async fn start_server() -> TestServer {
    let bus = EventBus::new(256);
    let worker = Arc::new(StubWorker::default());
    let coordinator = Arc::new(ScanCoordinator::new(
        CoordinatorConfig::default(),
        Arc::new(MemoryStore::new()),
        worker.clone(),
        bus.clone(),
    ));
    let app = lanscan::app(Arc::clone(&coordinator), bus.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        port,
        coordinator,
        bus,
        worker,
    }
}

fn operator() -> Principal {
    Principal::new("op", Role::Operator)
}

fn device(n: u8, ip: u8) -> DeviceSnapshot {
    DeviceSnapshot::new(
        MacAddress::parse(&format!("02:00:00:00:00:{n:02x}")).unwrap(),
        format!("192.168.1.{ip}").parse().unwrap(),
    )
}

/// Connect and subscribe to `topics`, waiting until the server applied it.
async fn connect_subscribed(server: &TestServer, topics: &[&str]) -> Ws {
    let (mut ws, _resp) = connect_async(server.ws_url()).await.expect("WS connect failed");
    let before = server.bus.subscribers_for(Topic::ScanStatus)
        + server.bus.subscribers_for(Topic::DeviceStatus)
        + server.bus.subscribers_for(Topic::Alert);
    ws.send(Message::Text(
        json!({ "type": "subscribe", "data": { "topics": topics } })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    while server.bus.subscribers_for(Topic::ScanStatus)
        + server.bus.subscribers_for(Topic::DeviceStatus)
        + server.bus.subscribers_for(Topic::Alert)
        < before + topics.len()
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    ws
}

/// Next text frame as JSON.
async fn next_json(ws: &mut Ws) -> Value {
    loop {
        match ws.next().await.expect("stream ended").expect("WS error") {
            Message::Text(txt) => return serde_json::from_str(&txt).expect("invalid JSON from server"),
            Message::Close(_) => panic!("server closed the connection"),
            _ => {}
        }
    }
}

/// Read frames until one of `kind` arrives.
async fn next_of_type(ws: &mut Ws, kind: &str) -> Value {
    loop {
        let json = next_json(ws).await;
        if json["type"] == kind {
            return json;
        }
    }
}

async fn post_start(server: &TestServer, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(server.http("/api/scan/start"))
        .header("x-user-id", "op")
        .header("x-user-role", "operator")
        .json(&body)
        .send()
        .await
        .unwrap()
}

// ── REST ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_worker_link() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let body: Value = reqwest::get(server.http("/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["worker_connected"], true);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn start_over_rest_then_conflict() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let resp = post_start(&server, json!({ "location_id": "L1", "scan_type": "quick" })).await;
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "running");
        let scan_id = body["scan_id"].as_str().unwrap().to_string();

        let resp = post_start(&server, json!({ "location_id": "L1", "scan_type": "full" })).await;
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["active_scan_id"], scan_id);

        // A different scope is independent.
        let resp = post_start(&server, json!({ "location_id": "L2", "scan_type": "quick" })).await;
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

        assert_eq!(server.worker.sent.lock().unwrap().len(), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn start_requires_identity() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let resp = reqwest::Client::new()
            .post(server.http("/api/scan/start"))
            .json(&json!({ "location_id": "L1", "scan_type": "quick" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

        let resp = reqwest::Client::new()
            .post(server.http("/api/scan/start"))
            .header("x-user-id", "v")
            .header("x-user-role", "viewer")
            .json(&json!({ "location_id": "L1", "scan_type": "quick" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
        assert!(server.worker.sent.lock().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

// ── WebSocket ────────────────────────────────────────────────────────

#[tokio::test]
async fn subscriber_sees_scan_lifecycle_in_order() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let mut ws = connect_subscribed(&server, &["scan_status"]).await;

        let resp = post_start(&server, json!({ "location_id": "L1", "scan_type": "quick" })).await;
        let body: Value = resp.json().await.unwrap();
        let scan_id: uuid::Uuid = body["scan_id"].as_str().unwrap().parse().unwrap();

        server.coordinator.handle_progress(scan_id, 42.4, 2).await.unwrap();
        server
            .coordinator
            .handle_completion(ScanReport {
                scan_id,
                devices: vec![device(1, 10)],
            })
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let json = next_json(&mut ws).await;
            assert_eq!(json["type"], "scan_status");
            assert_eq!(json["data"]["scan_id"], scan_id.to_string());
            seen.push((
                json["data"]["status"].as_str().unwrap().to_string(),
                json["data"]["progress"].as_u64().unwrap(),
            ));
        }
        assert_eq!(
            seen,
            vec![
                ("pending".to_string(), 0),
                ("running".to_string(), 0),
                ("running".to_string(), 42),
                ("completed".to_string(), 100),
            ]
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn topics_filter_delivery() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let mut alerts_only = connect_subscribed(&server, &["alerts"]).await;

        let job = server
            .coordinator
            .start_scan(&operator(), "L1", lanscan::scans::ScanOptions::quick())
            .await
            .unwrap();
        server.coordinator.handle_failure(job.id, "nmap crashed").await.unwrap();

        // The first frame this client sees is the failure alert, not any scan_status.
        let json = next_json(&mut alerts_only).await;
        assert_eq!(json["type"], "alert");
        assert_eq!(json["data"]["severity"], "error");
        assert!(json["data"]["message"].as_str().unwrap().contains("nmap crashed"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ip_change_new_device_and_offline_are_pushed() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        // Baseline: A, B, C online.
        let first = server
            .coordinator
            .start_scan(&operator(), "L1", lanscan::scans::ScanOptions::full())
            .await
            .unwrap();
        server
            .coordinator
            .handle_completion(ScanReport {
                scan_id: first.id,
                devices: vec![device(0xa, 10), device(0xb, 11), device(0xc, 12)],
            })
            .await
            .unwrap();

        let mut ws = connect_subscribed(&server, &["device_status", "alert"]).await;

        // A moved, B unchanged, C gone, D appeared.
        let second = server
            .coordinator
            .start_scan(&operator(), "L1", lanscan::scans::ScanOptions::full())
            .await
            .unwrap();
        server
            .coordinator
            .handle_completion(ScanReport {
                scan_id: second.id,
                devices: vec![device(0xa, 20), device(0xb, 11), device(0xd, 13)],
            })
            .await
            .unwrap()
            .expect("report applied");

        let mut changes = Vec::new();
        for _ in 0..3 {
            let json = next_of_type(&mut ws, "device_status").await;
            changes.push((
                json["data"]["mac"].as_str().unwrap().to_string(),
                json["data"]["status"].as_str().unwrap().to_string(),
                json["data"]["ip"].as_str().unwrap().to_string(),
            ));
        }
        changes.sort();
        assert_eq!(
            changes,
            vec![
                ("02:00:00:00:00:0a".into(), "changed".into(), "192.168.1.20".into()),
                ("02:00:00:00:00:0c".into(), "offline".into(), "192.168.1.12".into()),
                ("02:00:00:00:00:0d".into(), "new".into(), "192.168.1.13".into()),
            ]
        );

        let alert = next_of_type(&mut ws, "alert").await;
        assert_eq!(alert["data"]["title"], "New devices detected");

        // The device listing reflects the new state.
        let devices: Value = reqwest::Client::new()
            .get(server.http("/api/devices?location_id=L1"))
            .header("x-user-id", "v")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let offline: Vec<&str> = devices
            .as_array()
            .unwrap()
            .iter()
            .filter(|d| d["online"] == false)
            .map(|d| d["mac"].as_str().unwrap())
            .collect();
        assert_eq!(offline, vec!["02:00:00:00:00:0c"]);

        // The stored result carries the same partition.
        let result: Value = reqwest::Client::new()
            .get(server.http(&format!("/api/scan/results/{}", second.id)))
            .header("x-user-id", "v")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(result["new"].as_array().unwrap().len(), 1);
        assert_eq!(result["changed"].as_array().unwrap().len(), 1);
        assert_eq!(result["offline"].as_array().unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_wins_over_late_report() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let mut ws = connect_subscribed(&server, &["scan_status", "device_status"]).await;

        let resp = post_start(&server, json!({ "location_id": "L1", "scan_type": "quick" })).await;
        let body: Value = resp.json().await.unwrap();
        let scan_id: uuid::Uuid = body["scan_id"].as_str().unwrap().parse().unwrap();

        let resp = reqwest::Client::new()
            .post(server.http(&format!("/api/scan/cancel/{scan_id}")))
            .header("x-user-id", "op")
            .header("x-user-role", "admin")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "cancelled");

        let late = server
            .coordinator
            .handle_completion(ScanReport {
                scan_id,
                devices: vec![device(1, 10)],
            })
            .await
            .unwrap();
        assert!(late.is_none());

        // A second cancel is an idempotent no-op.
        let body: Value = reqwest::Client::new()
            .post(server.http(&format!("/api/scan/cancel/{scan_id}")))
            .header("x-user-id", "op")
            .header("x-user-role", "admin")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "cancelled");

        let statuses: Vec<String> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                let json = next_json(&mut ws).await;
                assert_eq!(json["type"], "scan_status");
                out.push(json["data"]["status"].as_str().unwrap().to_string());
            }
            out
        };
        assert_eq!(statuses, vec!["pending", "running", "cancelled"]);

        // Nothing else follows: no completion, no device events.
        let extra = timeout(Duration::from_millis(200), ws.next()).await;
        assert!(extra.is_err(), "unexpected frame after cancel: {extra:?}");

        let status: Value = reqwest::Client::new()
            .get(server.http(&format!("/api/scan/status/{scan_id}")))
            .header("x-user-id", "v")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["status"], "cancelled");
        assert!(server.coordinator.devices(Some("L1")).await.unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let mut ws = connect_subscribed(&server, &["scan_status"]).await;

        ws.send(Message::Text(
            json!({ "type": "unsubscribe", "data": { "topics": ["scan_status"] } })
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
        while server.bus.subscribers_for(Topic::ScanStatus) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        server
            .coordinator
            .start_scan(&operator(), "L1", lanscan::scans::ScanOptions::quick())
            .await
            .unwrap();

        let frame = timeout(Duration::from_millis(200), ws.next()).await;
        assert!(frame.is_err(), "unexpected frame after unsubscribe: {frame:?}");
    })
    .await
    .expect("test timed out");
}

// ── Client session ───────────────────────────────────────────────────

#[tokio::test]
async fn client_session_resyncs_then_streams() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let job = server
            .coordinator
            .start_scan(&operator(), "L1", lanscan::scans::ScanOptions::quick())
            .await
            .unwrap();

        let source = HttpStateSource::new(server.http(""), Principal::new("watcher", Role::Viewer));
        let (mut session, mut notices) = ClientSession::new(
            ReconnectPolicy::default(),
            Arc::new(WsTransport::new(server.ws_url())),
            Some(Arc::new(source)),
            [Topic::ScanStatus],
        );
        session.start();

        match notices.recv().await.unwrap() {
            SessionNotice::Resynced(snapshot) => {
                assert_eq!(snapshot.jobs.len(), 1);
                assert_eq!(snapshot.jobs[0].id, job.id);
                assert_eq!(snapshot.jobs[0].status, ScanStatus::Running);
            }
            other => panic!("expected resync first, got {other:?}"),
        }

        server.wait_for_subscribers(Topic::ScanStatus, 1).await;
        server.coordinator.handle_progress(job.id, 63.0, 5).await.unwrap();

        match notices.recv().await.unwrap() {
            SessionNotice::Event(PushEvent::ScanStatus { data, .. }) => {
                assert_eq!(data.scan_id, job.id);
                assert_eq!(data.progress, 63);
                assert_eq!(data.devices_found, 5);
            }
            other => panic!("expected scan_status, got {other:?}"),
        }

        session.shutdown();
    })
    .await
    .expect("test timed out");
}
