use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use conduit_dns_application::handler::{EntryHandler, EntryHandlerOpts, GateOpts};
use conduit_dns_domain::{Config, ListenProtocol, ServerConfig};
use conduit_dns_infrastructure::keys::{process_keys, ProcessKeys};
use conduit_dns_infrastructure::server::http_handler::{DohHandler, DohHandlerOpts};
use conduit_dns_infrastructure::server::https::{serve_doh, serve_doh3, Doh3ServerOpts};
use conduit_dns_infrastructure::server::quic::{serve_quic, QuicServerOpts};
use conduit_dns_infrastructure::server::tcp::{bind_tcp, serve_tcp, TcpServerOpts};
use conduit_dns_infrastructure::server::tls::build_acceptor;
use conduit_dns_infrastructure::server::udp::{bind_udp, serve_udp};
use conduit_dns_infrastructure::server::Server;

mod bootstrap;
mod graph;

#[derive(Parser)]
#[command(name = "conduit-dns")]
#[command(version)]
#[command(about = "Recursive-style DNS forwarder with a plugin pipeline")]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", default_value = "config.yaml")]
    config: String,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = bootstrap::load_config(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    bootstrap::init_logging(&config);

    info!("Starting conduit-dns v{}", env!("CARGO_PKG_VERSION"));

    // One in-flight task set for listeners and the racing client alike;
    // shutdown waits for all of it.
    let tracker = tokio_util::task::TaskTracker::new();
    let entry = graph::build_entry(&config, &tracker).await?;

    let needs_keys = config.servers.iter().any(|s| {
        s.protocol.requires_tls() || (s.protocol == ListenProtocol::Https && !s.cert.is_empty())
    });
    let keys = if needs_keys {
        Some(process_keys(&config.key_dir)?)
    } else {
        None
    };

    let mut servers: Vec<Arc<Server>> = Vec::new();
    for server_config in &config.servers {
        let handler = build_handler(&config, server_config, Arc::clone(&entry));
        let server = Server::new(
            Arc::new(handler),
            Duration::from_secs(server_config.idle_timeout),
            tracker.clone(),
        );
        start_listener(Arc::clone(&server), server_config.clone(), keys.clone()).await?;
        servers.push(server);
    }

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("shutdown signal received, draining in-flight queries");

    for server in &servers {
        server.close().await;
    }

    info!("shutdown complete");
    Ok(())
}

fn build_handler(
    config: &Config,
    server_config: &ServerConfig,
    entry: Arc<conduit_dns_application::executable::ChainNode>,
) -> EntryHandler {
    let mut opts = EntryHandlerOpts::new(entry);
    opts.query_timeout = Duration::from_secs(config.query_timeout);
    opts.recursion_available = config.recursion_available;
    opts.gate = GateOpts {
        block_aaaa: server_config.block_aaaa,
        block_ptr: server_config.block_ptr,
        block_https: server_config.block_https,
        block_no_dot: server_config.block_no_dot,
        strip_edns0: server_config.strip_edns0,
    };
    EntryHandler::new(opts)
}

async fn start_listener(
    server: Arc<Server>,
    cfg: ServerConfig,
    keys: Option<ProcessKeys>,
) -> anyhow::Result<()> {
    info!(protocol = %cfg.protocol, addr = %cfg.addr, "starting listener");

    let bind_addr: std::net::SocketAddr = cfg
        .addr
        .parse()
        .with_context(|| format!("bad listener addr '{}'", cfg.addr))?;

    match cfg.protocol {
        ListenProtocol::Udp => {
            let socket = bind_udp(bind_addr).context("bind udp listener")?;
            spawn_listener(cfg.protocol, cfg.addr.clone(), serve_udp(server, socket));
        }
        ListenProtocol::Tcp => {
            let listener = bind_tcp(bind_addr).context("bind tcp listener")?;
            let opts = TcpServerOpts {
                tls: None,
                allowed_sni: String::new(),
            };
            spawn_listener(
                cfg.protocol,
                cfg.addr.clone(),
                serve_tcp(server, listener, opts),
            );
        }
        ListenProtocol::Tls => {
            let listener = bind_tcp(bind_addr).context("bind tls listener")?;
            let acceptor = build_acceptor(&cfg.cert, &cfg.key, &[b"dot"])
                .with_context(|| format!("tls credentials for {}", cfg.addr))?;
            let opts = TcpServerOpts {
                tls: Some(acceptor),
                allowed_sni: cfg.allowed_sni.clone(),
            };
            spawn_listener(
                cfg.protocol,
                cfg.addr.clone(),
                serve_tcp(server, listener, opts),
            );
        }
        ListenProtocol::Https => {
            let listener = bind_tcp(bind_addr).context("bind https listener")?;
            let tls = if cfg.cert.is_empty() {
                None
            } else {
                Some(
                    build_acceptor(&cfg.cert, &cfg.key, &[b"h2", b"http/1.1"])
                        .with_context(|| format!("tls credentials for {}", cfg.addr))?,
                )
            };
            let doh = Arc::new(DohHandler::new(Arc::clone(&server), doh_opts(&cfg)));
            spawn_listener(
                cfg.protocol,
                cfg.addr.clone(),
                serve_doh(server, listener, tls, doh),
            );
        }
        ListenProtocol::Quic => {
            let keys = keys.context("quic listener requires process keys")?;
            let opts = QuicServerOpts {
                bind: bind_addr,
                cert: cfg.cert.clone(),
                key: cfg.key.clone(),
                zero_rtt: cfg.zero_rtt,
            };
            spawn_listener(cfg.protocol, cfg.addr.clone(), async move {
                serve_quic(server, opts, &keys).await
            });
        }
        ListenProtocol::H3 => {
            let keys = keys.context("h3 listener requires process keys")?;
            let opts = Doh3ServerOpts {
                bind: bind_addr,
                cert: cfg.cert.clone(),
                key: cfg.key.clone(),
            };
            let doh = Arc::new(DohHandler::new(Arc::clone(&server), doh_opts(&cfg)));
            spawn_listener(cfg.protocol, cfg.addr.clone(), async move {
                serve_doh3(server, opts, &keys, doh).await
            });
        }
    }
    Ok(())
}

fn doh_opts(cfg: &ServerConfig) -> DohHandlerOpts {
    DohHandlerOpts {
        path: cfg.path.clone(),
        src_ip_header: cfg.src_ip_header.clone(),
        redirect_url: cfg.redirect_url.clone(),
        ..Default::default()
    }
}

fn spawn_listener<F>(protocol: ListenProtocol, addr: String, fut: F)
where
    F: std::future::Future<Output = Result<(), conduit_dns_domain::DnsError>> + Send + 'static,
{
    tokio::spawn(async move {
        match fut.await {
            Err(conduit_dns_domain::DnsError::ServerClosed) => {
                info!(%protocol, %addr, "listener closed");
            }
            Err(e) => error!(%protocol, %addr, error = %e, "listener failed"),
            Ok(()) => {}
        }
    });
}
