use super::client::{MonitoringClient, DEFAULT_HEARTBEAT_INTERVAL};
use super::discovery::SrvResolver;
use super::registry::HandlerRegistry;
use super::types::ClientInfo;
use crate::client::tls::Dialer;
use crate::helpers::host_name;
use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Datacenter label -> SRV query
    pub queries: BTreeMap<String, String>,
    pub heartbeat_interval: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            queries: BTreeMap::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// One session per datacenter, each connected independently.
pub struct Stream {
    options: StreamOptions,
    info: Arc<ClientInfo>,
    handlers: Arc<HandlerRegistry>,
    resolver: Arc<dyn SrvResolver>,
    dialer: Arc<dyn Dialer>,
    clients: Mutex<HashMap<String, Arc<MonitoringClient>>>,
}

impl Stream {
    pub fn new(
        options: StreamOptions,
        info: ClientInfo,
        handlers: HandlerRegistry,
        resolver: Arc<dyn SrvResolver>,
        dialer: Arc<dyn Dialer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            info: Arc::new(info),
            handlers: Arc::new(handlers),
            resolver,
            dialer,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Start one connect task per configured datacenter.
    ///
    /// Failures are logged and only abandon the datacenter they happened in. The handles
    /// are returned for callers that want to know when every attempt has finished.
    pub fn connect(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.options
            .queries
            .iter()
            .map(|(datacenter, query)| {
                let stream = Arc::clone(self);
                let datacenter = datacenter.clone();
                let query = query.clone();

                tokio::spawn(async move {
                    match stream.connect_datacenter(&datacenter, &query).await {
                        Ok(_) => log::info!("[stream] {} is active", datacenter),
                        Err(e) => log::error!("[stream] giving up on {}: {:#}", datacenter, e),
                    }
                })
            })
            .collect()
    }

    /// Resolve, dial and handshake with the preferred collector of one datacenter
    pub async fn connect_datacenter(&self, datacenter: &str, query: &str) -> Result<Arc<MonitoringClient>> {
        log::info!("[stream] connecting to {} via {}", datacenter, query);

        let targets = self.resolver.resolve(query).await?;
        let first = targets
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no servers found for {}", query))?;

        let host = host_name(&first.target);
        log::debug!("[stream] {} -> {}:{}", datacenter, host, first.port);

        let transport = self.dialer.dial(host, first.port).await?;
        let client = MonitoringClient::new(
            transport,
            datacenter,
            Arc::clone(&self.info),
            Arc::clone(&self.handlers),
            self.options.heartbeat_interval,
        );

        self.add_client(datacenter, Arc::clone(&client));
        client
            .handshake()
            .await
            .with_context(|| format!("handshake with {}:{} failed", host, first.port))?;

        Ok(client)
    }

    pub fn add_client(&self, datacenter: &str, client: Arc<MonitoringClient>) {
        let previous = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(datacenter.to_string(), client);

        if previous.is_some() {
            log::warn!("[stream] replaced existing client for {}", datacenter);
        }
    }

    pub fn client(&self, datacenter: &str) -> Option<Arc<MonitoringClient>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(datacenter)
            .cloned()
    }

    pub fn datacenters(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }

    /// Park forever. Sessions run on their own tasks.
    pub async fn wait(&self) {
        std::future::pending::<()>().await
    }
}
