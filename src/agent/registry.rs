use super::client::MonitoringClient;
use super::host_info;
use crate::client::Message;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Handler for one inbound method
pub type HandlerFn = Arc<dyn Fn(Arc<MonitoringClient>, Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Maps inbound method names to their handlers.
///
/// Built once before any client exists and shared read-only between every client.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the handlers the agent answers out of the box
    pub fn with_defaults() -> Self {
        Self::new().register(host_info::METHOD, host_info::host_info_get)
    }

    pub fn register<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(Arc<MonitoringClient>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.insert(
            method.to_string(),
            Arc::new(move |client, msg| Box::pin(handler(client, msg)) as BoxFuture<'static, ()>),
        );
        self
    }

    pub fn get(&self, method: &str) -> Option<&HandlerFn> {
        self.handlers.get(method)
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    /// Run the handler for `msg` on its own task.
    ///
    /// Messages without a method or with an unknown one are logged and dropped; no
    /// reply is sent. Returns whether a handler was started.
    pub fn dispatch(&self, client: Arc<MonitoringClient>, msg: Message) -> bool {
        let handler = msg.method.as_deref().and_then(|method| self.get(method));

        match handler {
            Some(handler) => {
                let fut = handler(client, msg);
                tokio::spawn(fut);
                true
            }
            None => {
                log::debug!(
                    "[agent] unhandled message id={} method={:?} datacenter={}",
                    msg.id,
                    msg.method,
                    client.datacenter()
                );
                false
            }
        }
    }
}
