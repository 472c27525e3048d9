//! Integration tests for the WebSocket worker link.
//!
//! A fake worker listens on a random port; the real `WsWorkerChannel`
//! dials it and exchanges control frames.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use lanscan::config::WorkerConfig;
use lanscan::error::TransportError;
use lanscan::scans::{ScanJob, ScanOptions};
use lanscan::worker::channel::EVENT_BACKLOG;
use lanscan::worker::{WorkerChannel, WorkerCommand, WorkerEvent, WsWorkerChannel};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn config(port: u16) -> WorkerConfig {
    WorkerConfig {
        url: format!("ws://127.0.0.1:{port}"),
        send_timeout: Duration::from_secs(1),
        redial_delay: Duration::from_millis(50),
    }
}

/// Accept one link. Frames the coordinator sends arrive on the returned
/// receiver; strings pushed into the sender go back to the coordinator.
async fn fake_worker() -> (u16, mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let _ = inbound_tx.send(text.as_str().to_string());
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                },
                out = outbound_rx.recv() => {
                    let Some(text) = out else { break };
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    (port, inbound_rx, outbound_tx)
}

async fn wait_connected(channel: &WsWorkerChannel) {
    while !channel.is_connected() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn commands_reach_the_worker() {
    timeout(TEST_TIMEOUT, async {
        let (port, mut inbound, _outbound) = fake_worker().await;
        let channel = WsWorkerChannel::spawn(config(port));
        wait_connected(&channel).await;

        let job = ScanJob::new("L1", ScanOptions::custom(vec![22, 443], Some(5)));
        channel.send_command(&WorkerCommand::start(&job)).await.unwrap();
        channel.send_command(&WorkerCommand::cancel(job.id)).await.unwrap();

        let first: serde_json::Value = serde_json::from_str(&inbound.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "start_scan");
        assert_eq!(first["data"]["scan_id"], job.id.to_string());
        assert_eq!(first["data"]["location_id"], "L1");
        assert_eq!(first["data"]["options"]["ports"][1], 443);

        let second: WorkerCommand = serde_json::from_str(&inbound.recv().await.unwrap()).unwrap();
        assert_eq!(second, WorkerCommand::cancel(job.id));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn worker_events_are_streamed_and_junk_is_dropped() {
    timeout(TEST_TIMEOUT, async {
        let (port, _inbound, outbound) = fake_worker().await;
        let channel = WsWorkerChannel::spawn(config(port));
        let mut events = channel.events().await.unwrap();
        wait_connected(&channel).await;

        let id = Uuid::new_v4();
        outbound.send("not json".to_string()).unwrap();
        outbound
            .send(r#"{"type":"mystery","data":{}}"#.to_string())
            .unwrap();
        outbound
            .send(format!(
                r#"{{"type":"progress","data":{{"scan_id":"{id}","progress":12.5,"devices_found":1}}}}"#
            ))
            .unwrap();
        outbound
            .send(format!(
                r#"{{"type":"report","data":{{"scan_id":"{id}","devices":[{{"mac":"AA:BB:CC:00:00:01","ip":"10.0.0.5","ports":[{{"port":22,"service":"ssh"}}]}}]}}}}"#
            ))
            .unwrap();

        match events.next().await.unwrap() {
            WorkerEvent::Progress { scan_id, progress, devices_found } => {
                assert_eq!(scan_id, id);
                assert_eq!(progress, 12.5);
                assert_eq!(devices_found, 1);
            }
            other => panic!("expected progress, got {other:?}"),
        }
        match events.next().await.unwrap() {
            WorkerEvent::Report(report) => {
                assert_eq!(report.scan_id, id);
                assert_eq!(report.devices.len(), 1);
                assert_eq!(report.devices[0].mac.as_str(), "aa:bb:cc:00:00:01");
                assert_eq!(report.devices[0].services.len(), 1);
            }
            other => panic!("expected report, got {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unread_events_do_not_block_commands() {
    timeout(TEST_TIMEOUT, async {
        let (port, mut inbound, outbound) = fake_worker().await;
        let channel = WsWorkerChannel::spawn(config(port));
        // Taken but never polled.
        let mut events = channel.events().await.unwrap();
        wait_connected(&channel).await;

        let id = Uuid::new_v4();
        for _ in 0..EVENT_BACKLOG + 100 {
            outbound
                .send(format!(r#"{{"type":"ack","data":{{"scan_id":"{id}","command":"start_scan"}}}}"#))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let job = ScanJob::new("L1", ScanOptions::quick());
        channel.send_command(&WorkerCommand::start(&job)).await.unwrap();
        let frame: serde_json::Value = serde_json::from_str(&inbound.recv().await.unwrap()).unwrap();
        assert_eq!(frame["data"]["scan_id"], job.id.to_string());
        assert!(channel.is_connected());

        match events.next().await.unwrap() {
            WorkerEvent::Ack { scan_id, .. } => assert_eq!(scan_id, id),
            other => panic!("expected ack, got {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn event_stream_can_only_be_taken_once() {
    timeout(TEST_TIMEOUT, async {
        let channel = WsWorkerChannel::spawn(config(1));
        assert!(channel.events().await.is_ok());
        assert!(matches!(
            channel.events().await,
            Err(TransportError::StreamTaken)
        ));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn send_fails_fast_without_a_worker() {
    timeout(TEST_TIMEOUT, async {
        // Reserve a port, then free it so nothing is listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let channel = WsWorkerChannel::spawn(config(port));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!channel.is_connected());
        let job = ScanJob::new("L1", ScanOptions::quick());
        let started = tokio::time::Instant::now();
        let result = channel.send_command(&WorkerCommand::start(&job)).await;
        assert!(matches!(result, Err(TransportError::TransportUnavailable)));
        assert!(started.elapsed() < Duration::from_millis(500));
    })
    .await
    .expect("test timed out");
}
