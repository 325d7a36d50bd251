use super::call::{Call, DEFAULT_DONE_CAPACITY};
use super::error::ClientError;
use super::message::{Message, MessageCodec};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, MessageCodec>;

// bound on the transport's own shutdown (TLS close_notify) once the stream is closing
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct State {
    seq: u64,
    pending: HashMap<u64, Call>,
    closing: bool,  // user has called close
    shutdown: bool, // read side is dead
}

/// One bidirectional RPC stream.
///
/// Outbound requests are tracked in a pending table keyed by sequence id. A single read
/// task owns the inbound half: replies whose id is pending complete their call, every
/// other message is forwarded to the inbound channel returned by [`Connection::spawn`].
///
/// The writer lock serializes "assign id, register call, write bytes" so ids hit the
/// wire in order and messages never interleave. The state lock only guards the sequence
/// counter, the pending table and the shutdown flags, and is never held across I/O.
pub struct Connection {
    source: String,
    target: String,
    state: Mutex<State>,
    writer: AsyncMutex<Option<Writer>>,
    closed: CancellationToken,
}

impl Connection {
    /// Take ownership of `stream` and start its read task.
    ///
    /// Peer-initiated messages arrive on the returned receiver. It yields `None` once the
    /// connection has shut down.
    pub fn spawn<S>(
        stream: S,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);

        let conn = Arc::new(Self {
            source: source.into(),
            target: target.into(),
            state: Mutex::new(State::default()),
            writer: AsyncMutex::new(Some(FramedWrite::new(writer, MessageCodec::new()))),
            closed: CancellationToken::new(),
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(
            Arc::clone(&conn).read_loop(FramedRead::new(reader, MessageCodec::new()), inbound_tx),
        );

        (conn, inbound_rx)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// True once the connection was closed locally or its stream died
    pub fn is_shut_down(&self) -> bool {
        let state = self.lock_state();
        state.shutdown || state.closing
    }

    /// Send a request and report its completion on `done`.
    ///
    /// Returns once the request is written (or has failed); the reply arrives later on
    /// `done`. Callers sharing one `done` channel across calls must size it for all of
    /// them: a full channel drops the completion instead of blocking the read task.
    pub async fn go(&self, method: &str, args: Value, done: mpsc::Sender<Call>) {
        let mut writer = self.writer.lock().await;

        let seq = {
            let mut state = self.lock_state();
            if state.shutdown || state.closing {
                drop(state);
                Call::new(method, args, done).fail(ClientError::Shutdown);
                return;
            }

            let seq = state.seq;
            state.seq += 1;

            let mut call = Call::new(method, args.clone(), done);
            call.seq = seq;
            state.pending.insert(seq, call);
            seq
        };

        log::debug!("[client] write request id={} method={} target={}", seq, method, self.target);

        let request = Message::request(seq, &self.source, &self.target, method, args);
        if let Err(err) = self.write(&mut writer, request).await {
            // the read task may already have drained it
            let call = self.lock_state().pending.remove(&seq);
            if let Some(call) = call {
                call.fail(err);
            }
        }
    }

    /// Send a request with a freshly allocated done channel
    pub async fn send_request(&self, method: &str, args: Value) -> mpsc::Receiver<Call> {
        let (done, rx) = mpsc::channel(DEFAULT_DONE_CAPACITY);
        self.go(method, args, done).await;
        rx
    }

    /// Send a request and wait for its reply.
    ///
    /// There is no timeout: the wait ends with a reply or with the connection shutting
    /// down. Wrap in `tokio::time::timeout` where a bound is needed.
    pub async fn call(&self, method: &str, args: Value) -> Result<Message, ClientError> {
        let (done, mut rx) = mpsc::channel(1);
        self.go(method, args, done).await;

        match rx.recv().await {
            Some(call) => call.into_result(),
            None => Err(ClientError::Shutdown),
        }
    }

    /// Answer an inbound request. Nothing is registered in the pending table.
    pub async fn send_response(&self, request_id: u64, result: Value) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        if self.is_shut_down() {
            return Err(ClientError::Shutdown);
        }

        log::debug!("[client] write response id={} target={}", request_id, self.target);
        let response = Message::response(request_id, &self.source, &self.target, result);
        self.write(&mut writer, response).await
    }

    /// Write one message, giving up as soon as the connection starts closing so a peer
    /// that stopped reading cannot hold the writer lock forever.
    async fn write(&self, writer: &mut Option<Writer>, msg: Message) -> Result<(), ClientError> {
        let Some(sink) = writer.as_mut() else {
            return Err(ClientError::Shutdown);
        };

        tokio::select! {
            result = sink.send(msg) => result,
            _ = self.closed.cancelled() => Err(ClientError::Shutdown),
        }
    }

    /// Mark the connection as closing and shut the stream down.
    ///
    /// Outstanding calls complete with [`ClientError::Shutdown`]. A second call returns
    /// the same error without touching the stream.
    pub async fn close(&self) -> Result<(), ClientError> {
        {
            let mut state = self.lock_state();
            if state.closing {
                return Err(ClientError::Shutdown);
            }
            state.closing = true;
        }

        self.closed.cancel();

        let Some(sink) = self.writer.lock().await.take() else {
            return Err(ClientError::Shutdown);
        };

        // frames cut short by the cancellation are discarded, not flushed
        let mut io = sink.into_inner();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, io.shutdown()).await {
            Ok(result) => result.map_err(ClientError::from),
            Err(_) => {
                log::warn!("[client] shutdown of stream to {} timed out", self.target);
                Ok(())
            }
        }
    }

    async fn read_loop<R>(
        self: Arc<Self>,
        mut reader: FramedRead<R, MessageCodec>,
        inbound: mpsc::UnboundedSender<Message>,
    ) where
        R: AsyncRead + Unpin,
    {
        let failure = loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => None,
                next = reader.next() => next,
            };

            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(err)) => break Some(err),
                None => break None,
            };

            log::debug!(
                "[client] received message id={} method={:?} source={}",
                msg.id,
                msg.method,
                msg.source
            );

            let call = self.lock_state().pending.remove(&msg.id);
            match call {
                Some(mut call) => {
                    call.reply = Some(msg);
                    call.complete();
                }
                None => {
                    if let Err(mpsc::error::SendError(msg)) = inbound.send(msg) {
                        log::debug!("[client] no dispatcher for inbound message {}", msg.id);
                    }
                }
            }
        };

        self.terminate(failure);
    }

    /// Fail every outstanding call with the terminal error. Runs once, from the read task.
    fn terminate(&self, failure: Option<ClientError>) {
        let (err, pending) = {
            let mut state = self.lock_state();
            state.shutdown = true;

            let err = match failure {
                None | Some(ClientError::UnexpectedEof) if state.closing => ClientError::Shutdown,
                None => ClientError::UnexpectedEof,
                Some(err) => err,
            };
            let pending: Vec<Call> = state.pending.drain().map(|(_, call)| call).collect();
            (err, pending)
        };

        if err.is_shutdown() {
            log::info!("[client] connection to {} shut down: {}", self.target, err);
        } else {
            log::error!("[client] connection to {} failed: {}", self.target, err);
        }

        for call in pending {
            call.fail(err.clone());
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct Peer {
        reader: FramedRead<ReadHalf<DuplexStream>, MessageCodec>,
        writer: FramedWrite<WriteHalf<DuplexStream>, MessageCodec>,
    }

    impl Peer {
        async fn recv(&mut self) -> Message {
            self.reader.next().await.unwrap().unwrap()
        }

        async fn reply(&mut self, id: u64, result: Value) {
            self.writer
                .send(Message::response(id, "endpoint", "agent", result))
                .await
                .unwrap();
        }
    }

    fn pair() -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>, Peer) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (conn, inbound) = Connection::spawn(local, "agent", "endpoint");
        let (reader, writer) = tokio::io::split(remote);
        let peer = Peer {
            reader: FramedRead::new(reader, MessageCodec::new()),
            writer: FramedWrite::new(writer, MessageCodec::new()),
        };
        (conn, inbound, peer)
    }

    #[tokio::test]
    async fn test_call_returns_echoed_result() {
        let (conn, _inbound, mut peer) = pair();

        let caller = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.call("handshake.hello", json!({"token": "t"})).await }
        });

        let request = peer.recv().await;
        assert_eq!(request.method.as_deref(), Some("handshake.hello"));
        assert_eq!(request.version, "1");
        assert_eq!(request.source, "agent");
        assert_eq!(request.target, "endpoint");
        peer.reply(request.id, json!({"ok": true})).await;

        let reply = caller.await.unwrap().unwrap();
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.result, Some(json!({"ok": true})));
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_distinct_ordered_ids() {
        let (conn, _inbound, mut peer) = pair();

        let mut senders = Vec::new();
        for i in 0..20 {
            let conn = Arc::clone(&conn);
            senders.push(tokio::spawn(async move {
                conn.send_request("heartbeat.post", json!({"n": i})).await
            }));
        }

        let mut ids = Vec::new();
        for _ in 0..20 {
            // every frame decodes on its own, so no two writes interleaved
            ids.push(peer.recv().await.id);
        }
        assert_eq!(ids, (0..20).collect::<Vec<u64>>());

        for sender in senders {
            sender.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_out_of_order_replies_match_by_id() {
        let (conn, _inbound, mut peer) = pair();

        let mut first = conn.send_request("a", json!({})).await;
        let mut second = conn.send_request("b", json!({})).await;

        let a = peer.recv().await;
        let b = peer.recv().await;
        peer.reply(b.id, json!("for b")).await;
        peer.reply(a.id, json!("for a")).await;

        let call = second.recv().await.unwrap();
        assert_eq!(call.service_method, "b");
        assert_eq!(call.into_result().unwrap().result, Some(json!("for b")));

        let call = first.recv().await.unwrap();
        assert_eq!(call.service_method, "a");
        assert_eq!(call.into_result().unwrap().result, Some(json!("for a")));
    }

    #[tokio::test]
    async fn test_unmatched_ids_are_dispatched() {
        let (_conn, mut inbound, mut peer) = pair();

        let request = Message::request(77, "endpoint", "agent", "host_info.get", json!({"type": "CPU"}));
        peer.writer.send(request.clone()).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap(), request);

        // a stray response is still routed to dispatch rather than dropped
        peer.reply(1234, json!({})).await;
        let stray = inbound.recv().await.unwrap();
        assert_eq!(stray.id, 1234);
        assert!(!stray.is_request());
    }

    #[tokio::test]
    async fn test_peer_error_is_delivered_in_reply() {
        let (conn, _inbound, mut peer) = pair();

        let caller = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.call("handshake.hello", json!({})).await }
        });

        let request = peer.recv().await;
        let mut response = Message::response(request.id, "endpoint", "agent", Value::Null);
        response.result = None;
        response.error = Some(json!({"message": "bad token"}));
        peer.writer.send(response).await.unwrap();

        let reply = caller.await.unwrap().unwrap();
        assert_eq!(reply.error, Some(json!({"message": "bad token"})));
        assert!(!conn.is_shut_down());
    }

    #[tokio::test]
    async fn test_send_response_is_not_tracked() {
        let (conn, mut inbound, mut peer) = pair();

        conn.send_response(42, json!({"metrics": {}, "timestamp": 1})).await.unwrap();

        let response = peer.recv().await;
        assert_eq!(response.id, 42);
        assert!(response.method.is_none());
        assert_eq!(response.result, Some(json!({"metrics": {}, "timestamp": 1})));

        // an answer with the same id is not mistaken for a completion
        peer.reply(42, json!({})).await;
        assert_eq!(inbound.recv().await.unwrap().id, 42);
    }

    #[tokio::test]
    async fn test_close_fails_all_outstanding_calls() {
        let (conn, mut inbound, mut peer) = pair();

        let mut receivers = Vec::new();
        for _ in 0..3 {
            receivers.push(conn.send_request("slow", json!({})).await);
        }
        for _ in 0..3 {
            peer.recv().await;
        }

        conn.close().await.unwrap();

        for mut rx in receivers {
            let call = rx.recv().await.unwrap();
            assert!(matches!(call.error, Some(ClientError::Shutdown)));
        }
        assert!(conn.is_shut_down());
        assert!(inbound.recv().await.is_none());

        // fails fast without writing anything
        let call = conn.send_request("late", json!({})).await.recv().await.unwrap();
        assert!(matches!(call.error, Some(ClientError::Shutdown)));
        assert!(peer.reader.next().await.is_none());

        assert!(matches!(conn.close().await, Err(ClientError::Shutdown)));
        assert!(matches!(
            conn.send_response(1, json!({})).await,
            Err(ClientError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_close_interrupts_blocked_write() {
        // the peer end stays open but is never read
        let (local, _remote) = tokio::io::duplex(64);
        let (conn, _inbound) = Connection::spawn(local, "agent", "endpoint");

        let sender = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.send_request("big", json!("x".repeat(1024 * 1024))).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sender.is_finished());

        tokio::time::timeout(Duration::from_secs(2), conn.close())
            .await
            .expect("close waited on the stuck write")
            .unwrap();

        let mut rx = tokio::time::timeout(Duration::from_secs(2), sender)
            .await
            .unwrap()
            .unwrap();
        let call = rx.recv().await.unwrap();
        assert!(matches!(call.error, Some(ClientError::Shutdown)));
        assert!(conn.lock_state().pending.is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_completes_call() {
        let (local, remote) = tokio::io::duplex(1024);
        let (conn, _inbound) = Connection::spawn(local, "agent", "endpoint");
        drop(remote);

        let call = conn
            .send_request("heartbeat.post", json!({}))
            .await
            .recv()
            .await
            .unwrap();
        assert!(matches!(call.error, Some(ClientError::Io(_))));
        assert!(call.reply.is_none());
        assert!(conn.lock_state().pending.is_empty());
    }

    #[tokio::test]
    async fn test_peer_hangup_is_unexpected_eof() {
        let (conn, _inbound, mut peer) = pair();

        let mut rx = conn.send_request("handshake.hello", json!({})).await;
        peer.recv().await;
        drop(peer);

        let call = rx.recv().await.unwrap();
        assert!(matches!(call.error, Some(ClientError::UnexpectedEof)));
        assert!(call.reply.is_none());

        let err = conn.call("heartbeat.post", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::Shutdown));
    }

    #[tokio::test]
    async fn test_malformed_input_terminates_connection() {
        let (conn, _inbound, mut peer) = pair();

        let mut rx = conn.send_request("a", json!({})).await;
        peer.recv().await;

        use tokio::io::AsyncWriteExt;
        peer.writer.get_mut().write_all(b"}garbage").await.unwrap();

        let call = rx.recv().await.unwrap();
        assert!(matches!(call.error, Some(ClientError::Codec(_))));
        assert!(conn.is_shut_down());
    }
}
