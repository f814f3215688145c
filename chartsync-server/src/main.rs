use chartsync::{
    Delta, Event, Scope, SyncError, Workspace, WorkspaceConfig, emitter::Emitter, error::TaskError,
};
use chartsync_integration::{ChannelConfig, open_with, transport::ws};
use chrono::TimeDelta;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinSet,
};
use tokio_tungstenite::accept_async;
use tracing::{error, info, warn};

mod feed;

/// Compute process configuration, read from `CHARTSYNC_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
struct ServerConfig {
    addr: SocketAddr,
    channel_capacity: usize,
    workspace: WorkspaceConfig,
    tick_interval: Duration,
    ticks_per_bar: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 9101)),
            channel_capacity: ChannelConfig::default().capacity,
            workspace: WorkspaceConfig::default(),
            tick_interval: Duration::from_millis(250),
            ticks_per_bar: 8,
        }
    }
}

impl ServerConfig {
    fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Unset or unparsable values keep their default.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |name: &str| lookup(name).and_then(|value| value.trim().parse::<u64>().ok());

        let addr = lookup("CHARTSYNC_ADDR")
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.addr);

        let mut workspace = defaults.workspace;
        if let Some(millis) = parse("CHARTSYNC_PASS_INTERVAL_MS") {
            workspace = workspace.with_pass_interval(Duration::from_millis(millis));
        }
        if let Some(millis) = parse("CHARTSYNC_DRAIN_TIMEOUT_MS") {
            workspace = workspace.with_drain_timeout(Duration::from_millis(millis));
        }

        Self {
            addr,
            channel_capacity: parse("CHARTSYNC_CHANNEL_CAPACITY")
                .map(|capacity| (capacity as usize).max(1))
                .unwrap_or(defaults.channel_capacity),
            workspace,
            tick_interval: parse("CHARTSYNC_TICK_MS")
                .map(|millis| Duration::from_millis(millis.max(1)))
                .unwrap_or(defaults.tick_interval),
            ticks_per_bar: defaults.ticks_per_bar,
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    let config = Arc::new(ServerConfig::from_env());
    info!(
        addr = %config.addr,
        capacity = config.channel_capacity,
        pass_interval_ms = config.workspace.pass_interval.as_millis() as u64,
        "Starting chartsync compute server"
    );

    let listener = match TcpListener::bind(&config.addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(addr = %config.addr, %error, "failed to bind compute server");
            return;
        }
    };
    info!("Compute server listening on ws://{}", config.addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut connections = JoinSet::new();

    // Forward channel writers and readers of every connection
    let links = Emitter::new();

    loop {
        tokio::select! {
            biased;

            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    error!(%error, "failed to listen for ctrl-c, shutting down");
                }
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    info!(%peer_addr, "new presentation connection");
                    connections.spawn(handle_client(
                        stream,
                        peer_addr,
                        Arc::clone(&config),
                        links.clone(),
                        shutdown_rx.clone(),
                    ));
                }
                Err(error) => warn!(%error, "failed to accept connection"),
            },
        }
    }

    info!(
        connections = connections.len(),
        "shutdown requested, draining workspaces"
    );
    let _ = shutdown_tx.send(true);
    while connections.join_next().await.is_some() {}

    let report = links.shutdown(config.workspace.drain_timeout).await;
    info!(
        closed = report.completed,
        cancelled = report.cancelled,
        "compute server stopped"
    );
}

/// Serve one presentation process with its own demo workspace until either side closes.
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    links: Emitter,
    mut shutdown: watch::Receiver<bool>,
) {
    let websocket = match accept_async(stream).await {
        Ok(websocket) => websocket,
        Err(error) => {
            error!(%peer_addr, %error, "WebSocket handshake failed");
            return;
        }
    };

    let (sink, stream) = ws::split(websocket);
    let opened = open_with::<Scope, Delta, Event, _, _>(
        sink,
        stream,
        ChannelConfig::default().with_capacity(config.channel_capacity),
        &links,
    );
    let (deltas_tx, events_rx, link) = match opened {
        Ok(endpoint) => endpoint,
        Err(error) => {
            warn!(%peer_addr, %error, "refusing connection, server shutting down");
            return;
        }
    };

    let (retracks_tx, retracks_rx) = mpsc::unbounded_channel();
    let mut workspace = Workspace::new(config.workspace.clone(), deltas_tx)
        .with_history_loader(feed::loader(retracks_tx));
    let feed = match feed::build_demo(&mut workspace, TimeDelta::minutes(1), config.ticks_per_bar)
    {
        Ok(feed) => feed,
        Err(error) => {
            error!(%peer_addr, %error, "failed to build demo workspace");
            link.abort();
            return;
        }
    };

    // Stops once the workspace drops the bar receiver on its way out
    let (bars_tx, bars_rx) = mpsc::channel(config.channel_capacity);
    let tick_interval = config.tick_interval;
    let launched = workspace.emitter().launch("feed", None, async move {
        feed::run_feed(feed, bars_tx, retracks_rx, tick_interval).await;
        Ok::<_, TaskError>(())
    });
    if let Err(error) = launched {
        error!(%peer_addr, %error, "failed to launch bar feed");
        link.abort();
        return;
    }

    let stop = async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    };
    let result: Result<(), SyncError> = workspace.run(events_rx, bars_rx, stop).await;

    match result {
        Ok(()) => info!(%peer_addr, "workspace stopped"),
        Err(error) => warn!(%peer_addr, %error, "workspace stopped with error"),
    }

    match link.join().await {
        Ok(()) => info!(%peer_addr, "forward channel closed"),
        Err(error) => warn!(%peer_addr, %error, "forward channel closed with error"),
    }
}

/// Initialize logging
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
