use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use monitoring_agent::agent::config::AgentConfig;
use monitoring_agent::agent::discovery::DnsSrvResolver;
use monitoring_agent::agent::registry::HandlerRegistry;
use monitoring_agent::agent::stream::Stream;
use monitoring_agent::client::tls::{TlsDialer, TlsVerification};
use monitoring_agent::helpers;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "agent", version, about = "Monitoring agent")]
struct Cli {
    /// Token
    #[arg(long, short, env = "AGENT_TOKEN")]
    token: Option<String>,
    /// AgentId
    #[arg(long, short, env = "AGENT_ID")]
    agent_id: Option<String>,
    /// Name reported during the handshake
    #[arg(long, env = "AGENT_NAME")]
    agent_name: Option<String>,
    /// Config file [default: ~/.monitoring-agent/agent.toml]
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Datacenter SRV query as dc=query, repeatable. Replaces the configured set.
    #[arg(long = "query", value_parser = helpers::parse_query)]
    queries: Vec<(String, String)>,
    /// Verify collector certificates against the system trust store
    #[arg(long)]
    verify_tls: bool,
    #[clap(flatten)]
    verbose: Verbosity<InfoLevel>,
}

impl Cli {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(token) = &self.token {
            config.token = token.clone();
        }
        if let Some(agent_id) = &self.agent_id {
            config.agent_id = agent_id.clone();
        }
        if let Some(agent_name) = &self.agent_name {
            config.agent_name = agent_name.clone();
        }
        if !self.queries.is_empty() {
            config.queries = self.queries.iter().cloned().collect();
        }
        if self.verify_tls {
            config.tls_verification = TlsVerification::Webpki;
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AgentConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let info = config.client_info();
    log::info!(
        "[agent] starting {} (id: {}, version: {}, source: {})",
        info.agent_name,
        info.agent_id,
        info.version,
        info.source
    );

    let resolver = Arc::new(DnsSrvResolver::from_system_conf()?);
    let dialer = Arc::new(TlsDialer::new(config.tls_verification, config.connect_timeout())?);
    let stream = Stream::new(config.stream_options(), info, HandlerRegistry::with_defaults(), resolver, dialer);

    stream.connect();

    tokio::select! {
        _ = stream.wait() => {}
        _ = tokio::signal::ctrl_c() => log::info!("[agent] interrupted, shutting down"),
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new().filter_level(cli.verbose.log_level_filter()).init();

    if let Err(e) = run(cli).await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
