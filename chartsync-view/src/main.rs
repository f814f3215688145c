use chartsync::{
    Delta, Event, PresentationAdapter, Scope,
    primitive::{Anchor, Primitive},
};
use chartsync_integration::{
    ChannelConfig, ChannelSender, open, stream::timeout::TimeoutStream, transport::ws,
};
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

mod config;
mod renderer;

use config::ViewConfig;
use renderer::{LogRenderer, ObjectView};

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    let config = ViewConfig::from_env();
    info!(url = %config.url, "Starting chartsync view");

    if let Err(error) = run(config).await {
        error!(%error, "view stopped with error");
        std::process::exit(1);
    }
}

/// Mirror the compute server until it closes the channel or ctrl-c is pressed.
async fn run(config: ViewConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (websocket, _) = connect_async(&config.url).await?;
    info!(url = %config.url, "connected to compute server");

    let channel = ChannelConfig::default()
        .with_capacity(config.channel_capacity)
        .with_idle_timeout(config.idle_timeout);
    let (sink, stream) = ws::split(websocket);
    let stream = TimeoutStream::new(stream, channel.idle_timeout);
    let (events_tx, mut deltas_rx, link) = open::<Scope, Event, Delta, _, _>(sink, stream, channel);

    let mut adapter = PresentationAdapter::new(
        config.adapter.clone(),
        LogRenderer::new(config.summary_every),
    );
    let mut frame = tokio::time::interval(config.frame_interval);
    frame.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut closing = false;
    let mut annotated = false;

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown, if !closing => {
                info!("closing forward channel");
                closing = true;

                // Off the render loop: deltas keep draining until the peer acknowledges
                let closer = events_tx.clone();
                tokio::spawn(async move {
                    if let Err(error) = closer.close().await {
                        warn!(%error, "forward channel close failed");
                    }
                });
            }

            _ = frame.tick() => {
                adapter.receive_ready(&mut deltas_rx);
                let report = adapter.apply_pending();
                if report.dropped > 0 || report.duplicates > 0 {
                    debug!(?report, "frame applied with skips");
                }

                if !annotated && !closing {
                    annotated = annotate(&adapter, &events_tx).await;
                }
            }

            envelope = deltas_rx.recv() => match envelope {
                Some(envelope) => adapter.enqueue(envelope),
                None => break,
            },
        }
    }

    while adapter.pending() > 0 {
        adapter.apply_pending();
    }
    adapter.renderer().log_summary();
    info!(
        frames = adapter.renderer().frames(),
        last_applied = adapter.last_applied(),
        "compute server closed the channel"
    );

    link.join().await?;
    Ok(())
}

/// Drop a note on the first series with a price, exercising the event path back to the
/// compute process. Returns true once the event has been sent.
async fn annotate(
    adapter: &PresentationAdapter<LogRenderer>,
    events_tx: &ChannelSender<Scope, Event>,
) -> bool {
    let Some((scope, close)) = adapter.renderer().objects().find_map(|(scope, _, view)| match view {
        ObjectView::Series {
            last_close: Some(close),
            ..
        } => Some((scope.clone(), *close)),
        _ => None,
    }) else {
        return false;
    };

    let note = Primitive::new("note", vec![Anchor::new(Utc::now(), close)])
        .with_style("text", serde_json::json!("view connected"));

    let (scope, event) = match adapter.create_primitive(&scope, note) {
        Ok(request) => request,
        Err(error) => {
            debug!(%scope, %error, "pane not mirrored yet");
            return false;
        }
    };

    match events_tx.send(scope, event).await {
        Ok(()) => true,
        Err(error) => {
            warn!(%error, "failed to send primitive event");
            error.is_terminal()
        }
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
