use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use std::cmp::Reverse;

/// One SRV answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// Resolves a datacenter's SRV query into candidate collector addresses
#[async_trait]
pub trait SrvResolver: Send + Sync {
    /// Answers ordered by preference, best first
    async fn resolve(&self, query: &str) -> Result<Vec<SrvTarget>>;
}

/// Lowest priority first, then heaviest weight
pub fn sort_targets(targets: &mut [SrvTarget]) {
    targets.sort_by_key(|t| (t.priority, Reverse(t.weight)));
}

/// SRV lookups through the system resolver configuration
pub struct DnsSrvResolver {
    resolver: TokioAsyncResolver,
}

impl DnsSrvResolver {
    pub fn from_system_conf() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().context("failed to read system resolver configuration")?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl SrvResolver for DnsSrvResolver {
    async fn resolve(&self, query: &str) -> Result<Vec<SrvTarget>> {
        let lookup = self
            .resolver
            .srv_lookup(query)
            .await
            .with_context(|| format!("SRV lookup for {} failed", query))?;

        let mut targets: Vec<SrvTarget> = lookup
            .iter()
            .map(|srv| SrvTarget {
                target: srv.target().to_utf8(),
                port: srv.port(),
                priority: srv.priority(),
                weight: srv.weight(),
            })
            .collect();

        sort_targets(&mut targets);
        log::debug!("[stream] {} resolved to {:?}", query, targets);
        Ok(targets)
    }
}
