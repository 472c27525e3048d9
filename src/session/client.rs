//! Keeps one push connection alive and in sync.
//!
//! A single driver task owns the connection, the backoff timer and the retry
//! count. `shutdown` (or dropping the session) aborts it, so no timer can
//! outlive the session.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backoff::ReconnectPolicy;
use super::resync::{StateSnapshot, StateSource};
use super::transport::{PushConnection, Transport};
use crate::events::model::{ClientMessage, PushEvent, Topic};

/// Where the session's connection lifecycle stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting { attempt: u32 },
    Connected,
    Backoff { attempt: u32, delay: Duration },
    Failed,
}

/// What the session reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// A pushed event, in server order.
    Event(PushEvent),
    /// Fresh state pulled after (re)connecting; replaces local state.
    Resynced(StateSnapshot),
    /// Connection lost; next attempt after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries exhausted. Sent exactly once per run; `rearm` starts a new run.
    ConnectivityFailed { attempts: u32 },
}

pub struct ClientSession {
    policy: ReconnectPolicy,
    transport: Arc<dyn Transport>,
    source: Option<Arc<dyn StateSource>>,
    topics: Arc<Mutex<BTreeSet<Topic>>>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    state: watch::Sender<SessionState>,
    control: Option<mpsc::UnboundedSender<ClientMessage>>,
    driver: Option<JoinHandle<()>>,
}

impl ClientSession {
    /// Create an idle session. Notices arrive on the returned receiver.
    pub fn new(
        policy: ReconnectPolicy,
        transport: Arc<dyn Transport>,
        source: Option<Arc<dyn StateSource>>,
        topics: impl IntoIterator<Item = Topic>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Idle);
        let session = Self {
            policy,
            transport,
            source,
            topics: Arc::new(Mutex::new(topics.into_iter().collect())),
            notices,
            state,
            control: None,
            driver: None,
        };
        (session, rx)
    }

    /// Start connecting. No-op while a driver is already running.
    pub fn start(&mut self) {
        if self.driver.as_ref().is_some_and(|d| !d.is_finished()) {
            return;
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            policy: self.policy.clone(),
            transport: self.transport.clone(),
            source: self.source.clone(),
            topics: self.topics.clone(),
            notices: self.notices.clone(),
            state: self.state.clone(),
            control: control_rx,
        };
        self.control = Some(control_tx);
        self.driver = Some(tokio::spawn(driver.run()));
    }

    /// Restart after `ConnectivityFailed`. Ignored in any other state.
    pub fn rearm(&mut self) {
        if *self.state.borrow() != SessionState::Failed {
            debug!("Rearm ignored, session not failed");
            return;
        }
        self.driver = None;
        self.state.send_replace(SessionState::Idle);
        self.start();
    }

    /// Stop the driver and any pending reconnect.
    pub fn shutdown(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.control = None;
        self.state.send_replace(SessionState::Idle);
    }

    /// Add topics; sent immediately when connected and re-sent on every reconnect.
    pub fn subscribe(&self, topics: impl IntoIterator<Item = Topic>) {
        let topics: Vec<Topic> = topics.into_iter().collect();
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(topics.iter().copied());
        self.forward(ClientMessage::Subscribe { topics });
    }

    pub fn unsubscribe(&self, topics: impl IntoIterator<Item = Topic>) {
        let topics: Vec<Topic> = topics.into_iter().collect();
        {
            let mut current = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            for topic in &topics {
                current.remove(topic);
            }
        }
        self.forward(ClientMessage::Unsubscribe { topics });
    }

    fn forward(&self, message: ClientMessage) {
        if let Some(control) = &self.control {
            let _ = control.send(message);
        }
    }

    pub fn topics(&self) -> BTreeSet<Topic> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

struct Driver {
    policy: ReconnectPolicy,
    transport: Arc<dyn Transport>,
    source: Option<Arc<dyn StateSource>>,
    topics: Arc<Mutex<BTreeSet<Topic>>>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    state: watch::Sender<SessionState>,
    control: mpsc::UnboundedReceiver<ClientMessage>,
}

impl Driver {
    async fn run(mut self) {
        // Consecutive failures since the last stable connection.
        let mut attempt: u32 = 0;

        loop {
            self.state.send_replace(SessionState::Connecting { attempt: attempt + 1 });

            match self.transport.connect().await {
                Ok(conn) => {
                    let opened = Instant::now();
                    self.state.send_replace(SessionState::Connected);
                    info!("Push session connected");

                    self.serve(conn).await;

                    if self.policy.is_stable(opened.elapsed()) {
                        attempt = 0;
                    }
                    warn!("Push session connection lost");
                }
                Err(e) => debug!(error = %e, "Push connect failed"),
            }

            attempt += 1;
            if self.policy.exhausted(attempt) {
                let attempts = attempt - 1;
                warn!(attempts, "Push session giving up");
                self.state.send_replace(SessionState::Failed);
                let _ = self.notices.send(SessionNotice::ConnectivityFailed { attempts });
                return;
            }

            let delay = self.policy.delay_for(attempt);
            self.state.send_replace(SessionState::Backoff { attempt, delay });
            let _ = self.notices.send(SessionNotice::Reconnecting { attempt, delay });
            tokio::time::sleep(delay).await;
        }
    }

    /// Resubscribe, resync, then forward events until the connection closes.
    async fn serve(&mut self, mut conn: Box<dyn PushConnection>) {
        // Changes requested while disconnected are already in `topics`.
        // Anything queued after this point is forwarded below.
        while self.control.try_recv().is_ok() {}

        let topics: Vec<Topic> = self
            .topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        if !topics.is_empty() && conn.send(&ClientMessage::Subscribe { topics }).await.is_err() {
            return;
        }

        if let Some(source) = &self.source {
            match source.fetch().await {
                Ok(snapshot) => {
                    let _ = self.notices.send(SessionNotice::Resynced(snapshot));
                }
                Err(e) => warn!(error = %e, "Resync failed, continuing with pushed events"),
            }
        }

        loop {
            tokio::select! {
                message = self.control.recv() => {
                    let Some(message) = message else { return };
                    if conn.send(&message).await.is_err() {
                        return;
                    }
                }
                event = conn.next_event() => {
                    match event {
                        Some(event) => {
                            let _ = self.notices.send(SessionNotice::Event(event));
                        }
                        None => return,
                    }
                }
            }
        }
    }
}
