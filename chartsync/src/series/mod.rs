use crate::error::SeriesError;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::debug;

/// Trading session calendar and whitespace slot generation.
pub mod calendar;

pub use calendar::{SessionCalendar, SessionWindow};

/// Default number of whitespace slots reserved ahead of the last bar.
pub const DEFAULT_WHITESPACE_BARS: usize = 500;

/// Trading session a [`Bar`] belongs to.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Session {
    #[default]
    Regular,
    Extended,
}

/// Normalised OHLCV bar.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct Bar {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub session: Session,
}

impl Bar {
    /// Construct a regular session bar.
    pub fn new(time: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
            session: Session::Regular,
        }
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = session;
        self
    }
}

/// How a successful ingestion changed the stored history.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SeriesChange {
    /// Bar added after the last stored bar.
    Appended,
    /// Last bar replaced by a bar with the same time.
    Updated,
    /// Late extended session bar placed at `index`.
    Inserted { index: usize },
}

/// Authoritative bar history of one symbol and interval, plus its whitespace tail.
///
/// Bar times are strictly increasing and unique. A regular hours store only accepts bars
/// after its last bar. An extended hours store with a calendar classifies every bar by
/// session: regular session bars must still follow the last regular bar, while extended
/// session bars arriving late are inserted at their sorted position.
#[derive(Debug, Clone)]
pub struct SeriesStore {
    symbol: SmolStr,
    interval: TimeDelta,
    extended_hours: bool,
    calendar: Option<SessionCalendar>,
    bars: Vec<Bar>,
    whitespace: Vec<DateTime<Utc>>,
    whitespace_bars: usize,
    revision: u64,
}

impl SeriesStore {
    pub fn new(symbol: impl Into<SmolStr>, interval: TimeDelta, extended_hours: bool) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            extended_hours,
            calendar: None,
            bars: Vec::new(),
            whitespace: Vec::new(),
            whitespace_bars: DEFAULT_WHITESPACE_BARS,
            revision: 0,
        }
    }

    pub fn with_whitespace_bars(mut self, count: usize) -> Self {
        self.whitespace_bars = count;
        self
    }

    pub fn symbol(&self) -> &SmolStr {
        &self.symbol
    }

    pub fn interval(&self) -> TimeDelta {
        self.interval
    }

    pub fn is_extended_hours(&self) -> bool {
        self.extended_hours
    }

    pub fn calendar(&self) -> Option<&SessionCalendar> {
        self.calendar.as_ref()
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    /// Placeholder future slots reserved ahead of the last bar.
    pub fn whitespace(&self) -> &[DateTime<Utc>] {
        &self.whitespace
    }

    /// Incremented on every change to the history or the whitespace tail.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Ingest a new bar.
    pub fn append(&mut self, bar: Bar) -> Result<SeriesChange, SeriesError> {
        let bar = self.admit(bar)?;
        let change = self.place(bar)?;
        self.changed();
        Ok(change)
    }

    /// Ingest a bar, replacing the last bar if it carries the same time (a still forming
    /// live bar). Otherwise behaves as [`Self::append`].
    pub fn upsert(&mut self, bar: Bar) -> Result<SeriesChange, SeriesError> {
        let bar = self.admit(bar)?;

        if let Some(last) = self.bars.last_mut().filter(|last| last.time == bar.time) {
            *last = bar;
            self.changed();
            return Ok(SeriesChange::Updated);
        }

        let change = self.place(bar)?;
        self.changed();
        Ok(change)
    }

    /// Replace the entire history, validating it bar by bar. On failure the current
    /// history is left untouched.
    pub fn reset(&mut self, bars: impl IntoIterator<Item = Bar>) -> Result<(), SeriesError> {
        let mut replacement = self.clone_config();

        for bar in bars {
            let bar = replacement.admit(bar)?;
            replacement.place(bar)?;
        }

        self.bars = replacement.bars;
        self.changed();
        Ok(())
    }

    /// Point the store at another symbol or interval, discarding the history and its
    /// whitespace tail. Session mode and calendar are kept.
    pub fn retarget(
        &mut self,
        symbol: impl Into<SmolStr>,
        interval: TimeDelta,
    ) -> Result<(), SeriesError> {
        if interval <= TimeDelta::zero() {
            return Err(SeriesError::InvalidInterval {
                secs: interval.num_seconds(),
            });
        }

        self.symbol = symbol.into();
        self.interval = interval;
        self.bars.clear();
        self.changed();
        debug!(symbol = %self.symbol, interval_secs = interval.num_seconds(), "series retargeted");
        Ok(())
    }

    /// Regenerate the whitespace tail from `calendar`, adopting it for session
    /// classification and every later regeneration.
    ///
    /// Idempotent: an unchanged calendar and history produce an identical tail.
    pub fn extend_whitespace(&mut self, calendar: &SessionCalendar) -> &[DateTime<Utc>] {
        if self.calendar.as_ref() != Some(calendar) {
            self.calendar = Some(calendar.clone());
        }

        if self.regenerate_whitespace() {
            self.revision += 1;
        }
        &self.whitespace
    }

    fn clone_config(&self) -> Self {
        Self {
            symbol: self.symbol.clone(),
            interval: self.interval,
            extended_hours: self.extended_hours,
            calendar: self.calendar.clone(),
            bars: Vec::new(),
            whitespace: Vec::new(),
            whitespace_bars: self.whitespace_bars,
            revision: self.revision,
        }
    }

    /// Validate a bar's session against the store mode, classifying it by calendar when
    /// extended hours are enabled.
    fn admit(&self, mut bar: Bar) -> Result<Bar, SeriesError> {
        if !self.extended_hours {
            if bar.session == Session::Extended {
                return Err(SeriesError::ExtendedBarRejected { time: bar.time });
            }
            return Ok(bar);
        }

        if let Some(calendar) = &self.calendar {
            bar.session = calendar
                .classify(bar.time)
                .ok_or(SeriesError::OutsideSession { time: bar.time })?;
        }
        Ok(bar)
    }

    fn place(&mut self, bar: Bar) -> Result<SeriesChange, SeriesError> {
        let Some(last) = self.bars.last() else {
            self.bars.push(bar);
            return Ok(SeriesChange::Appended);
        };

        if bar.time > last.time {
            self.bars.push(bar);
            return Ok(SeriesChange::Appended);
        }

        let relaxed = self.extended_hours && self.calendar.is_some();
        if !relaxed {
            return Err(SeriesError::OutOfOrder {
                time: bar.time,
                last: last.time,
            });
        }

        if bar.session == Session::Regular {
            if let Some(last_regular) = self
                .bars
                .iter()
                .rev()
                .find(|stored| stored.session == Session::Regular)
                .filter(|stored| bar.time <= stored.time)
            {
                return Err(SeriesError::OutOfOrder {
                    time: bar.time,
                    last: last_regular.time,
                });
            }
        }

        match self.bars.binary_search_by(|stored| stored.time.cmp(&bar.time)) {
            Ok(index) => Err(SeriesError::OutOfOrder {
                time: bar.time,
                last: self.bars[index].time,
            }),
            Err(index) => {
                debug!(
                    symbol = %self.symbol,
                    time = %bar.time,
                    index,
                    "inserting late bar at its session position"
                );
                self.bars.insert(index, bar);
                Ok(SeriesChange::Inserted { index })
            }
        }
    }

    fn changed(&mut self) {
        self.revision += 1;
        self.regenerate_whitespace();
    }

    /// Returns true if the tail changed.
    fn regenerate_whitespace(&mut self) -> bool {
        let tail = match (&self.calendar, self.bars.last()) {
            (Some(calendar), Some(last)) => calendar.slots_after(
                last.time,
                self.interval,
                self.whitespace_bars,
                self.extended_hours,
            ),
            _ => Vec::new(),
        };

        if tail == self.whitespace {
            return false;
        }
        self.whitespace = tail;
        true
    }
}
