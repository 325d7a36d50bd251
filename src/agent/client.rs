use super::registry::HandlerRegistry;
use super::types::{ClientInfo, SessionState};
use crate::client::{ClientError, Connection, Message};
use crate::helpers;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub const HANDSHAKE_METHOD: &str = "handshake.hello";
pub const HEARTBEAT_METHOD: &str = "heartbeat.post";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(40_000);

/// `target` stamped on everything the agent sends
pub const ENDPOINT_TARGET: &str = "endpoint";

/// Session with one collector endpoint.
///
/// Owns the connection, drains inbound requests into the handler registry and, once the
/// handshake succeeds, keeps the session alive with periodic heartbeats.
pub struct MonitoringClient {
    connection: Arc<Connection>,
    datacenter: String,
    info: Arc<ClientInfo>,
    handlers: Arc<HandlerRegistry>,
    heartbeat_interval: Duration,
    state: watch::Sender<SessionState>,
}

impl MonitoringClient {
    pub fn new<S>(
        stream: S,
        datacenter: impl Into<String>,
        info: Arc<ClientInfo>,
        handlers: Arc<HandlerRegistry>,
        heartbeat_interval: Duration,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let datacenter = datacenter.into();
        let heartbeat_interval = if heartbeat_interval.is_zero() {
            log::warn!("[agent] zero heartbeat interval for {}, using {:?}", datacenter, DEFAULT_HEARTBEAT_INTERVAL);
            DEFAULT_HEARTBEAT_INTERVAL
        } else {
            heartbeat_interval
        };

        let (connection, inbound) = Connection::spawn(stream, info.source.clone(), ENDPOINT_TARGET);
        let (state, _) = watch::channel(SessionState::Connected);

        let client = Arc::new(Self {
            connection,
            datacenter,
            info,
            handlers,
            heartbeat_interval,
            state,
        });

        tokio::spawn(Arc::clone(&client).serve(inbound));
        client
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Answer an inbound request
    pub async fn respond(&self, request: &Message, result: Value) -> Result<(), ClientError> {
        self.connection.send_response(request.id, result).await
    }

    /// Present credentials and, on success, start the heartbeat.
    ///
    /// Failures are returned to the caller without retry; the session stays out of
    /// `Active`.
    pub async fn handshake(self: &Arc<Self>) -> Result<(), ClientError> {
        self.set_state(SessionState::Handshaking);

        let params = json!({
            "token": self.info.token,
            "agent_id": self.info.agent_id,
            "agent_name": self.info.agent_name,
            "process_version": self.info.version,
            "bundle_version": self.info.version,
        });

        let outcome = match self.connection.call(HANDSHAKE_METHOD, params).await {
            Ok(reply) => match reply.error {
                Some(error) if !error.is_null() => Err(ClientError::Rejected {
                    method: HANDSHAKE_METHOD.to_string(),
                    error,
                }),
                _ => Ok(reply),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(reply) => {
                log::info!(
                    "[agent] handshake with {} accepted: {}",
                    self.datacenter,
                    reply.result.unwrap_or(Value::Null)
                );
                self.set_state(SessionState::Active);
                tokio::spawn(Arc::clone(self).heartbeat());
                Ok(())
            }
            Err(e) => {
                log::error!("[agent] handshake with {} failed: {}", self.datacenter, e);
                if self.connection.is_shut_down() {
                    self.set_state(SessionState::Closed);
                } else {
                    self.set_state(SessionState::Connected);
                }
                Err(e)
            }
        }
    }

    /// Close the underlying connection. Outstanding calls fail with a shutdown error.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.connection.close().await
    }

    async fn serve(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Message>) {
        while let Some(msg) = inbound.recv().await {
            log::debug!("[agent] {} <- {:?} id={}", self.datacenter, msg.method, msg.id);
            self.handlers.dispatch(Arc::clone(&self), msg);
        }

        log::info!("[agent] connection to {} closed", self.datacenter);
        self.set_state(SessionState::Closed);
    }

    async fn heartbeat(self: Arc<Self>) {
        let mut ticker = interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.connection.is_shut_down() {
                break;
            }

            log::debug!("[agent] heartbeat to {}", self.datacenter);
            // fire and forget; the reply is never inspected
            drop(
                self.connection
                    .send_request(HEARTBEAT_METHOD, json!({ "timestamp": helpers::timestamp() }))
                    .await,
            );
        }

        log::debug!("[agent] heartbeat to {} stopped", self.datacenter);
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == SessionState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

impl fmt::Debug for MonitoringClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoringClient")
            .field("datacenter", &self.datacenter)
            .field("source", &self.info.source)
            .field("state", &self.state())
            .finish()
    }
}
