use chartsync::{
    AdapterConfig, BarUpdate, Delta, PresentationAdapter, Renderer, Scope, Workspace,
    WorkspaceConfig,
    error::IndicatorError,
    id::{IdKind, ObjectId, PaneScope},
    layout::Layout,
    primitive::{Anchor, Primitive},
    protocol::Event,
    series::Bar,
    watcher::{Output, Point, UpdateContext},
};
use chartsync_integration::{ChannelConfig, ChannelReceiver, open, transport::memory};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Default)]
struct Recorder {
    applied: Vec<(Scope, Delta)>,
}

impl Renderer for Recorder {
    fn apply(&mut self, scope: &Scope, delta: &Delta) {
        self.applied.push((scope.clone(), delta.clone()));
    }

    fn flush(&mut self) {}
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn minute(m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 15, m, 0).unwrap()
}

fn bar(m: u32, close: f64) -> Bar {
    Bar::new(minute(m), close, close, close, close, 10.0)
}

fn last_close(ctx: &UpdateContext) -> Result<Output, IndicatorError> {
    let window = ctx.window(0, 1);
    let points = window
        .times()
        .into_iter()
        .zip(window.values())
        .map(|(time, value)| Point::new(time, value))
        .collect();
    Ok(Output::Values(points))
}

/// Receive and apply deltas until `done` holds for the adapter.
async fn pump_until(
    adapter: &mut PresentationAdapter<Recorder>,
    deltas: &mut ChannelReceiver<Scope, Delta>,
    done: impl Fn(&PresentationAdapter<Recorder>) -> bool,
) {
    let wait = async {
        while !done(adapter) {
            let Some(envelope) = deltas.recv().await else {
                panic!("forward channel closed early");
            };
            adapter.enqueue(envelope);
            adapter.receive_ready(deltas);
            adapter.apply_pending();
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("presentation side did not converge");
}

fn primitives(adapter: &PresentationAdapter<Recorder>) -> Vec<(PaneScope, ObjectId)> {
    adapter.registry().find(|kind| *kind == IdKind::Primitive)
}

#[tokio::test]
async fn test_compute_to_presentation_round_trip() {
    init_logging();

    let (compute, presentation) = memory::pair(64);
    let (deltas_tx, events_rx, compute_link) = open::<Scope, Delta, Event, _, _>(
        compute.0,
        compute.1,
        ChannelConfig::default().with_capacity(64),
    );
    let (events_tx, mut deltas_rx, _presentation_link) = open::<Scope, Event, Delta, _, _>(
        presentation.0,
        presentation.1,
        ChannelConfig::default().with_capacity(64),
    );

    // Compute side: a two pane frame with a series, an indicator and a drawn line
    let mut workspace = Workspace::new(
        WorkspaceConfig::default()
            .with_pass_interval(Duration::from_millis(5))
            .with_whitespace_bars(5),
        deltas_tx,
    );
    let frame = workspace.add_frame(Layout::DoubleVertical).unwrap();
    let scopes: Vec<_> = workspace.layout().frame(&frame).unwrap().scopes().collect();
    let (left, right) = (scopes[0].clone(), scopes[1].clone());

    let series = workspace
        .add_series(&left, "AAPL", TimeDelta::minutes(1), false)
        .unwrap();
    workspace
        .load_series(&left, &series, vec![bar(0, 10.0), bar(1, 11.0)])
        .unwrap();
    let close = workspace
        .attach_indicator(&left, "close", &[series.clone()], last_close)
        .unwrap();
    workspace
        .create_primitive(
            &left,
            Primitive::new("trend_line", vec![Anchor::new(minute(0), 10.0)]),
        )
        .unwrap();

    let (bars_tx, bars_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let compute_task = tokio::spawn(workspace.run(events_rx, bars_rx, async move {
        let _ = shutdown_rx.await;
    }));

    // Presentation side mirrors the layout, series, indicator and primitive
    let mut adapter = PresentationAdapter::new(AdapterConfig::default(), Recorder::default());
    pump_until(&mut adapter, &mut deltas_rx, |adapter| {
        adapter.registry().contains(&left, &close) && !primitives(adapter).is_empty()
    })
    .await;

    let (drawn_scope, drawn) = primitives(&adapter).remove(0);
    assert_eq!(drawn_scope, left);
    assert!(matches!(
        adapter.renderer().applied.first(),
        Some((Scope::Window, Delta::FrameAdd { .. }))
    ));

    // User drags the line into the other pane
    let (scope, event) = adapter.move_primitive(&left, &drawn, &right).unwrap();
    events_tx.send(scope, event).await.unwrap();

    pump_until(&mut adapter, &mut deltas_rx, |adapter| {
        primitives(adapter).iter().any(|(scope, _)| scope == &right)
    })
    .await;

    let moved = primitives(&adapter);
    assert_eq!(moved.len(), 1);
    assert_ne!(moved[0], (left.clone(), drawn.clone()));

    // Live bar flows through the series into the indicator
    bars_tx
        .send(BarUpdate {
            scope: left.clone(),
            series: series.clone(),
            bar: bar(2, 12.5),
        })
        .await
        .unwrap();

    let expected = close.clone();
    pump_until(&mut adapter, &mut deltas_rx, move |adapter| {
        adapter.renderer().applied.iter().any(|(_, delta)| {
            matches!(
                delta,
                Delta::IndicatorUpdate { object_id, output: Output::Values(points), .. }
                    if object_id == &expected && points.last().and_then(|p| p.value) == Some(12.5)
            )
        })
    })
    .await;

    // Two-phase close: the presentation side sees the end of the stream
    shutdown_tx.send(()).unwrap();
    assert_eq!(compute_task.await.unwrap(), Ok(()));

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(envelope) = deltas_rx.recv().await {
            adapter.enqueue(envelope);
        }
    })
    .await;
    assert!(drained.is_ok());
    adapter.apply_pending();

    assert_eq!(compute_link.join().await, Ok(()));
    assert!(events_tx.is_closed());
    assert_eq!(
        adapter.last_applied(),
        adapter.renderer().applied.len() as u64
    );
}
