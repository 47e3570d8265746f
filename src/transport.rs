//! Live-stream transport collaborator.
//!
//! The platform client itself is an external process; this module talks to
//! its local event bridge, which streams NDJSON-framed events per account.
//! The transport is modeled as a trait emitting a discriminated event type
//! so the supervisor state machine can be driven by a scripted fake in tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Events emitted by the transport for one connected account.
///
/// A successful `connect()` call is itself the connect signal; everything
/// after that arrives through the event receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// Viewer-count sample
    Viewer { count: u64 },
    /// A monetizable contribution, attributable to one contributor identity
    Gift {
        contributor_id: String,
        display_name: String,
        points: u64,
    },
    /// Connection dropped without the stream ending
    Disconnect,
    /// The stream finished normally
    End,
    /// Transport-level error while connected
    Error { detail: String },
}

/// Connection attempt failure.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("transport error: {detail}")]
pub struct TransportError {
    pub detail: String,
}

impl TransportError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }

    /// Classify this failure for the retry policy.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::from_detail(&self.detail)
    }
}

/// Severe error subclasses that warrant a deduplicated alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SevereKind {
    RateLimit,
    Banned,
    ApiFault,
}

impl SevereKind {
    /// Alert dedup category key (one alert per category per day).
    pub fn category(&self) -> &'static str {
        match self {
            SevereKind::RateLimit => "rate-limit",
            SevereKind::Banned => "banned",
            SevereKind::ApiFault => "api-fault",
        }
    }
}

/// Error taxonomy driving the supervisor's retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The account is simply not streaming right now
    Offline,
    /// Recoverable connection failure, fixed short retry
    Transient,
    /// Recoverable, but surfaced once per day via the alert path
    Severe(SevereKind),
}

impl ErrorClass {
    /// Classify an error detail string.
    pub fn from_detail(detail: &str) -> Self {
        let lower = detail.to_lowercase();

        if lower.contains("user_not_found")
            || lower.contains("room_id")
            || lower.contains("no active room")
            || lower.contains("not live")
            || lower.contains("offline")
        {
            ErrorClass::Offline
        } else if lower.contains("rate limit") || lower.contains("429") {
            ErrorClass::Severe(SevereKind::RateLimit)
        } else if lower.contains("banned") {
            ErrorClass::Severe(SevereKind::Banned)
        } else if lower.contains("api error") {
            ErrorClass::Severe(SevereKind::ApiFault)
        } else {
            ErrorClass::Transient
        }
    }
}

/// The transport collaborator interface.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Attempt to connect to one account's live stream.
    ///
    /// Resolving `Ok` is the connect signal; the receiver then yields the
    /// session's events until disconnect or end-of-stream.
    async fn connect(
        &self,
        account: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;
}

/// First line returned by the bridge after a subscribe request.
#[derive(Debug, Deserialize)]
struct BridgeAck {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// NDJSON event bridge client.
///
/// Protocol: connect TCP, send `{"subscribe": "<account>"}`, read one ack
/// line, then one event object per line until EOF. EOF without an explicit
/// `end` event is reported as a bare disconnect.
pub struct BridgeTransport {
    addr: String,
}

impl BridgeTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl LiveTransport for BridgeTransport {
    async fn connect(
        &self,
        account: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::new(format!("bridge unreachable: {}", e)))?;

        let (read_half, mut write_half) = stream.into_split();

        let subscribe = serde_json::json!({ "subscribe": account }).to_string();
        write_half
            .write_all(format!("{}\n", subscribe).as_bytes())
            .await
            .map_err(|e| TransportError::new(format!("bridge write failed: {}", e)))?;

        let mut lines = BufReader::new(read_half).lines();

        let ack_line = lines
            .next_line()
            .await
            .map_err(|e| TransportError::new(format!("bridge read failed: {}", e)))?
            .ok_or_else(|| TransportError::new("bridge closed before ack"))?;

        let ack: BridgeAck = serde_json::from_str(&ack_line)
            .map_err(|e| TransportError::new(format!("bad bridge ack: {}", e)))?;

        if let Some(detail) = ack.error {
            return Err(TransportError::new(detail));
        }
        if !ack.ok {
            return Err(TransportError::new("bridge refused subscription"));
        }

        let (tx, rx) = mpsc::channel(64);
        let account = account.to_string();

        tokio::spawn(async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<TransportEvent>(&line) {
                            Ok(event) => {
                                let ended = matches!(
                                    event,
                                    TransportEvent::End | TransportEvent::Disconnect
                                );
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                                if ended {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "[{}] Skipping malformed bridge line: {}",
                                    account,
                                    e
                                );
                            }
                        }
                    }
                    // EOF without an explicit end: bare disconnect
                    Ok(None) => {
                        let _ = tx.send(TransportEvent::Disconnect).await;
                        return;
                    }
                    Err(e) => {
                        let _ = tx
                            .send(TransportEvent::Error {
                                detail: format!("bridge read failed: {}", e),
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Outcome of one scripted connection attempt.
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    /// Connect succeeds and the receiver yields these events in order
    Events(Vec<TransportEvent>),
    /// Connect fails with this error
    Fail(TransportError),
}

/// Scripted transport for tests: each account pops pre-loaded connection
/// outcomes in order. An exhausted script fails as offline so a supervisor
/// under test settles into the idle path.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<ConnectOutcome>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next connection attempt for an account.
    pub fn push(&self, account: &str, outcome: ConnectOutcome) {
        self.scripts
            .lock()
            .entry(account.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Remaining scripted attempts for an account.
    pub fn remaining(&self, account: &str) -> usize {
        self.scripts
            .lock()
            .get(account)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl LiveTransport for ScriptedTransport {
    async fn connect(
        &self,
        account: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let outcome = self
            .scripts
            .lock()
            .get_mut(account)
            .and_then(|q| q.pop_front());

        match outcome {
            Some(ConnectOutcome::Events(events)) => {
                let (tx, rx) = mpsc::channel(events.len().max(1));
                for event in events {
                    let _ = tx.try_send(event);
                }
                Ok(rx)
            }
            Some(ConnectOutcome::Fail(err)) => Err(err),
            None => Err(TransportError::new("user_not_found: script exhausted")),
        }
    }
}
