//! RPC transport for collector endpoints
//!
//! A [`connection::Connection`] carries JSON messages in both directions over one
//! stream. Requests we send are tracked by sequence id until their reply arrives;
//! anything else the peer sends is a request for us and is handed to the caller.
//!
//! # Wire format
//!
//! ```text
//! {"v":"1","id":7,"target":"endpoint","source":"<instance id>",
//!  "method":"heartbeat.post","params":{"timestamp":...},"error":null}
//! ```
//!
//! Responses omit `method`/`params` and carry `result` or `error` under the id of the
//! request they answer.
pub mod call;
pub mod connection;
pub mod error;
pub mod message;
pub mod tls;

pub use call::Call;
pub use connection::Connection;
pub use error::ClientError;
pub use message::{Message, MessageCodec};
