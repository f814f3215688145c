use chartsync::{
    BarUpdate, HistoryRequest, PaneScope, SyncError, Workspace,
    error::{HistoryError, IndicatorError},
    id::ObjectId,
    layout::Layout,
    primitive::{Anchor, Primitive},
    series::Bar,
    watcher::{Output, Point, UpdateContext},
};
use chrono::{DateTime, TimeDelta, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Bars of history loaded into each demo series before the live feed starts.
pub const HISTORY_BARS: usize = 240;

/// Uniform step random walk over a positive price.
#[derive(Debug)]
pub struct RandomWalk {
    rng: StdRng,
    price: f64,
    step: f64,
}

impl RandomWalk {
    pub fn new(rng: StdRng, price: f64, step: f64) -> Self {
        Self { rng, price, step }
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn next_price(&mut self) -> f64 {
        let change = self.rng.random_range(-self.step..=self.step);
        self.price = (self.price * (1.0 + change)).max(0.01);
        self.price
    }

    fn volume(&mut self) -> f64 {
        self.rng.random_range(1.0..100.0)
    }
}

/// One series of the demo workspace and the bar currently forming for it.
#[derive(Debug)]
struct FeedSeries {
    scope: PaneScope,
    id: ObjectId,
    interval: TimeDelta,
    walk: RandomWalk,
    forming: Bar,
    ticks: u32,
}

/// Live continuation of a series whose history was just generated by [`loader`].
#[derive(Debug)]
pub struct Retrack {
    pub scope: PaneScope,
    pub id: ObjectId,
    pub interval: TimeDelta,
    pub walk: RandomWalk,
    pub last: Bar,
}

/// Synthetic live bars for every demo series. Each tick revises the forming bar; every
/// `ticks_per_bar` ticks a new bar opens one interval later.
#[derive(Debug)]
pub struct Feed {
    series: Vec<FeedSeries>,
    ticks_per_bar: u32,
}

impl Feed {
    pub fn new(ticks_per_bar: u32) -> Self {
        Self {
            series: Vec::new(),
            ticks_per_bar: ticks_per_bar.max(1),
        }
    }

    /// Track a series whose last loaded bar is `last`.
    pub fn track(
        &mut self,
        scope: PaneScope,
        id: ObjectId,
        interval: TimeDelta,
        walk: RandomWalk,
        last: Bar,
    ) {
        self.series.push(FeedSeries {
            scope,
            id,
            interval,
            walk,
            forming: last,
            ticks: self.ticks_per_bar,
        });
    }

    /// Continue a tracked series from reloaded history. Returns false if it is not tracked.
    pub fn retrack(&mut self, retrack: Retrack) -> bool {
        let Some(series) = self
            .series
            .iter_mut()
            .find(|series| series.scope == retrack.scope && series.id == retrack.id)
        else {
            return false;
        };

        series.interval = retrack.interval;
        series.walk = retrack.walk;
        series.forming = retrack.last;
        series.ticks = self.ticks_per_bar;
        true
    }

    pub fn tick(&mut self) -> Vec<BarUpdate> {
        let ticks_per_bar = self.ticks_per_bar;

        self.series
            .iter_mut()
            .map(|series| {
                let interval = series.interval;
                let price = series.walk.next_price();
                let volume = series.walk.volume();

                if series.ticks >= ticks_per_bar {
                    let open = series.forming.close;
                    series.forming = Bar::new(
                        series.forming.time + interval,
                        open,
                        open.max(price),
                        open.min(price),
                        price,
                        volume,
                    );
                    series.ticks = 1;
                } else {
                    let bar = &mut series.forming;
                    bar.high = bar.high.max(price);
                    bar.low = bar.low.min(price);
                    bar.close = price;
                    bar.volume += volume;
                    series.ticks += 1;
                }

                BarUpdate {
                    scope: series.scope.clone(),
                    series: series.id.clone(),
                    bar: series.forming,
                }
            })
            .collect()
    }
}

/// `count` completed bars ending one interval before `end`.
pub fn history(
    walk: &mut RandomWalk,
    end: DateTime<Utc>,
    interval: TimeDelta,
    count: usize,
) -> Vec<Bar> {
    let start = end - interval * count as i32;

    (0..count)
        .map(|index| {
            let open = walk.price();
            let close = walk.next_price();
            let volume = walk.volume();
            Bar::new(
                start + interval * index as i32,
                open,
                open.max(close),
                open.min(close),
                close,
                volume,
            )
        })
        .collect()
}

/// History loader generating a fresh random walk for the requested symbol and interval.
/// The live continuation of every generated history is sent to the feed on `retracks`.
pub fn loader(
    retracks: mpsc::UnboundedSender<Retrack>,
) -> impl Fn(&HistoryRequest) -> Result<Vec<Bar>, HistoryError> + Send + Sync + 'static {
    move |request: &HistoryRequest| {
        let mut walk = RandomWalk::new(StdRng::from_os_rng(), seed_price(&request.symbol), 0.002);
        let end = align(Utc::now(), request.interval);
        let bars = history(&mut walk, end, request.interval, HISTORY_BARS);
        let last = bars
            .last()
            .copied()
            .ok_or_else(|| HistoryError::from("empty history"))?;

        retracks
            .send(Retrack {
                scope: request.scope.clone(),
                id: request.series.clone(),
                interval: request.interval,
                walk,
                last,
            })
            .map_err(|_| HistoryError::from("feed stopped"))?;
        Ok(bars)
    }
}

/// Deterministic starting price for a symbol.
fn seed_price(symbol: &str) -> f64 {
    let sum: u64 = symbol.bytes().map(u64::from).sum();
    20.0 + (sum % 180) as f64
}

/// Simple moving average of the close of input 0. The `period` option overrides `period`.
pub fn sma(period: usize) -> impl FnMut(&UpdateContext) -> Result<Output, IndicatorError> + Send {
    move |ctx| {
        let period = ctx.option("period").unwrap_or(period);
        rolling(ctx, period, |closes| closes.iter().sum::<f64>() / closes.len() as f64)
    }
}

/// Rolling standard deviation of the close of input 0. The `period` option overrides
/// `period`.
pub fn stdev(
    period: usize,
) -> impl Fn(&UpdateContext) -> Result<Output, IndicatorError> + Send + Sync + 'static {
    move |ctx| {
        let period = ctx.option("period").unwrap_or(period);
        rolling(ctx, period, |closes| {
            let mean = closes.iter().sum::<f64>() / closes.len() as f64;
            let variance =
                closes.iter().map(|close| (close - mean).powi(2)).sum::<f64>() / closes.len() as f64;
            variance.sqrt()
        })
    }
}

fn rolling(
    ctx: &UpdateContext,
    period: usize,
    reduce: impl Fn(&[f64]) -> f64,
) -> Result<Output, IndicatorError> {
    let Some(Output::Bars(bars)) = ctx.input(0) else {
        return Err(IndicatorError::from("expected a bar series input"));
    };
    if period == 0 {
        return Err(IndicatorError::from("period must be positive"));
    }

    let closes: Vec<f64> = bars.iter().map(|bar| bar.close).collect();
    let points = bars
        .iter()
        .enumerate()
        .map(|(index, bar)| {
            let value = (index + 1 >= period).then(|| reduce(&closes[index + 1 - period..=index]));
            Point::new(bar.time, value)
        })
        .collect();

    Ok(Output::Values(points))
}

/// Populate a fresh workspace with a two pane frame: a priced series with an inline SMA, an
/// offloaded volatility study and a drawn price level on the left, a second instrument on
/// the right.
pub fn build_demo(
    workspace: &mut Workspace,
    interval: TimeDelta,
    ticks_per_bar: u32,
) -> Result<Feed, SyncError> {
    let frame = workspace.add_frame(Layout::DoubleVertical)?;
    let scopes: Vec<PaneScope> = workspace.layout().frame(&frame)?.scopes().collect();
    let now = align(Utc::now(), interval);
    let mut feed = Feed::new(ticks_per_bar);

    for (scope, (symbol, price)) in scopes.iter().zip([("DEMO", 100.0), ("DEMO.B", 42.0)]) {
        let mut walk = RandomWalk::new(StdRng::from_os_rng(), price, 0.002);
        let bars = history(&mut walk, now, interval, HISTORY_BARS);
        let Some(last) = bars.last().copied() else {
            continue;
        };

        let series = workspace.add_series(scope, symbol, interval, false)?;
        workspace.load_series(scope, &series, bars)?;
        workspace.attach_indicator(scope, "sma(20)", &[series.clone()], sma(20))?;

        if symbol == "DEMO" {
            workspace.attach_offloaded(scope, "stdev(20)", &[series.clone()], stdev(20))?;
            workspace.create_primitive(
                scope,
                Primitive::new("horizontal_line", vec![Anchor::new(last.time, last.close)])
                    .with_style("color", serde_json::json!("#f5a623")),
            )?;
        }

        debug!(%scope, %series, symbol, "demo series loaded");
        feed.track(scope.clone(), series, interval, walk, last);
    }

    info!(%frame, panes = scopes.len(), "demo workspace ready");
    Ok(feed)
}

/// Push a tick from `feed` every `period` until the workspace stops listening, moving
/// series onto reloaded history as it arrives on `retracks`.
pub async fn run_feed(
    mut feed: Feed,
    tx: mpsc::Sender<BarUpdate>,
    mut retracks: mpsc::UnboundedReceiver<Retrack>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!("bar receiver dropped, stopping feed");
                return;
            }
            Some(retrack) = retracks.recv() => {
                let (scope, id) = (retrack.scope.clone(), retrack.id.clone());
                if !feed.retrack(retrack) {
                    debug!(%scope, %id, "reloaded series is not fed");
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        for update in feed.tick() {
            if tx.send(update).await.is_err() {
                debug!("bar receiver dropped, stopping feed");
                return;
            }
        }
    }
}

fn align(time: DateTime<Utc>, interval: TimeDelta) -> DateTime<Utc> {
    let step = interval.num_seconds().max(1);
    let secs = time.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(step), 0).unwrap_or(time)
}
