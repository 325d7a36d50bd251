use super::error::ClientError;
use super::message::Message;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Capacity of the done channel allocated by [`Connection::send_request`](super::connection::Connection::send_request)
pub const DEFAULT_DONE_CAPACITY: usize = 10;

/// An active RPC.
///
/// Owned by the connection's pending table until the read task delivers a reply or an
/// error, then handed back to the caller through `done`.
#[derive(Debug)]
pub struct Call {
    pub service_method: String,
    pub args: Value,
    pub seq: u64,
    pub reply: Option<Message>,
    pub error: Option<ClientError>,
    done: mpsc::Sender<Call>,
}

impl Call {
    pub(crate) fn new(service_method: &str, args: Value, done: mpsc::Sender<Call>) -> Self {
        Self {
            service_method: service_method.to_string(),
            args,
            seq: 0,
            reply: None,
            error: None,
            done,
        }
    }

    /// Signal completion without blocking.
    ///
    /// A full done channel means the caller under-provisioned it; the call is dropped
    /// rather than stalling the read task.
    pub(crate) fn complete(self) {
        let done = self.done.clone();
        match done.try_send(self) {
            Ok(()) => {}
            Err(TrySendError::Full(call)) => {
                log::debug!("[client] done channel full, discarding call {} ({})", call.seq, call.service_method);
            }
            Err(TrySendError::Closed(call)) => {
                log::debug!("[client] nobody waiting on call {} ({})", call.seq, call.service_method);
            }
        }
    }

    pub(crate) fn fail(mut self, err: ClientError) {
        self.error = Some(err);
        self.complete();
    }

    /// Delivered reply, or the error that ended the call
    pub fn into_result(self) -> Result<Message, ClientError> {
        match (self.error, self.reply) {
            (Some(err), _) => Err(err),
            (None, Some(reply)) => Ok(reply),
            (None, None) => Err(ClientError::Shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_delivers_once() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut call = Call::new("handshake.hello", json!({}), tx);
        call.seq = 5;
        call.reply = Some(Message::response(5, "a", "b", json!({"ok": true})));
        call.complete();

        let done = rx.recv().await.unwrap();
        assert_eq!(done.seq, 5);
        assert_eq!(done.into_result().unwrap().result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_full_channel_does_not_block() {
        let (tx, mut rx) = mpsc::channel(1);
        Call::new("a", Value::Null, tx.clone()).fail(ClientError::Shutdown);
        Call::new("b", Value::Null, tx).fail(ClientError::Shutdown);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.service_method, "a");
        // the delivered call carries the last sender
        drop(first);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_error_wins_over_reply() {
        let (tx, _rx) = mpsc::channel(1);
        let mut call = Call::new("a", Value::Null, tx);
        call.reply = Some(Message::default());
        call.error = Some(ClientError::UnexpectedEof);
        assert!(matches!(call.into_result(), Err(ClientError::UnexpectedEof)));
    }

    #[test]
    #[should_panic]
    fn test_zero_capacity_done_channel_panics() {
        let _ = mpsc::channel::<Call>(0);
    }
}
