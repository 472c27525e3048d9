//! The coordinator's only path to the scanning worker.

use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::stream::{self, Stream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::protocol::{WorkerCommand, WorkerEvent};
use crate::config::WorkerConfig;
use crate::error::TransportError;

/// Stream of inbound worker events.
pub type WorkerEventStream = Pin<Box<dyn Stream<Item = WorkerEvent> + Send>>;

/// Sends commands to the worker and yields its events.
#[async_trait]
pub trait WorkerChannel: Send + Sync {
    /// Deliver one command. Fails fast with `TransportUnavailable` when the
    /// link is down, and never waits longer than the configured send timeout.
    async fn send_command(&self, command: &WorkerCommand) -> Result<(), TransportError>;

    /// Take the inbound event stream. Only the first call succeeds.
    async fn events(&self) -> Result<WorkerEventStream, TransportError>;

    /// Whether a live connection is currently established.
    fn is_connected(&self) -> bool;
}

/// Inbound events buffered for the consumer before new ones are dropped.
pub const EVENT_BACKLOG: usize = 1024;

type Outbound = (String, oneshot::Sender<Result<(), String>>);

/// WebSocket link to the worker with automatic redial.
pub struct WsWorkerChannel {
    config: WorkerConfig,
    link: Arc<RwLock<Option<mpsc::Sender<Outbound>>>>,
    events_rx: Mutex<Option<mpsc::Receiver<WorkerEvent>>>,
    task: JoinHandle<()>,
}

impl WsWorkerChannel {
    /// Start dialing the worker in the background.
    pub fn spawn(config: WorkerConfig) -> Self {
        let link = Arc::new(RwLock::new(None));
        let (events_tx, events_rx) = mpsc::channel(EVENT_BACKLOG);
        let task = tokio::spawn(run_link(config.clone(), link.clone(), events_tx));

        Self {
            config,
            link,
            events_rx: Mutex::new(Some(events_rx)),
            task,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Outbound>> {
        self.link.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Drop for WsWorkerChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl WorkerChannel for WsWorkerChannel {
    async fn send_command(&self, command: &WorkerCommand) -> Result<(), TransportError> {
        let tx = self.sender().ok_or(TransportError::TransportUnavailable)?;
        let text = serde_json::to_string(command)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        let timeout = self.config.send_timeout;

        let delivery = async {
            tx.send((text, ack_tx))
                .await
                .map_err(|_| TransportError::TransportUnavailable)?;
            match ack_rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(reason)) => {
                    debug!(reason, "Worker write failed");
                    Err(TransportError::TransportUnavailable)
                }
                Err(_) => Err(TransportError::TransportUnavailable),
            }
        };

        match tokio::time::timeout(timeout, delivery).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::SendTimeout(timeout)),
        }
    }

    async fn events(&self) -> Result<WorkerEventStream, TransportError> {
        let rx = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or(TransportError::StreamTaken)?;

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(Box::pin(stream))
    }

    fn is_connected(&self) -> bool {
        self.sender().is_some_and(|tx| !tx.is_closed())
    }
}

/// Hand an inbound event to the consumer. Never waits; the event is dropped
/// when the consumer is behind or has not taken the stream.
fn forward_event(events_tx: &mpsc::Sender<WorkerEvent>, event: WorkerEvent) {
    match events_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!(scan_id = %event.scan_id(), "Worker event backlog full, dropping event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Dial, pump, redial. Runs until aborted.
async fn run_link(
    config: WorkerConfig,
    link: Arc<RwLock<Option<mpsc::Sender<Outbound>>>>,
    events_tx: mpsc::Sender<WorkerEvent>,
) {
    loop {
        match connect_async(config.url.as_str()).await {
            Ok((ws, _)) => {
                info!(url = %config.url, "Worker link connected");
                let (mut sink, mut frames) = ws.split();
                let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);
                *link.write().unwrap_or_else(|e| e.into_inner()) = Some(out_tx);

                loop {
                    tokio::select! {
                        outbound = out_rx.recv() => {
                            let Some((text, ack)) = outbound else { break };
                            let result = sink
                                .send(Message::Text(text.into()))
                                .await
                                .map_err(|e| e.to_string());
                            let failed = result.is_err();
                            let _ = ack.send(result);
                            if failed {
                                break;
                            }
                        }

                        frame = frames.next() => {
                            match frame {
                                Some(Ok(Message::Text(text))) => {
                                    if let Some(event) = WorkerEvent::parse(&text) {
                                        forward_event(&events_tx, event);
                                    }
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    if sink.send(Message::Pong(data)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Err(e)) => {
                                    warn!(error = %e, "Worker link error");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                }

                *link.write().unwrap_or_else(|e| e.into_inner()) = None;
                warn!(url = %config.url, "Worker link disconnected");
            }
            Err(e) => {
                debug!(url = %config.url, error = %e, "Worker unreachable");
            }
        }

        tokio::time::sleep(config.redial_delay).await;
    }
}
