use super::Session;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// Longest closed stretch crossed while searching for the next whitespace slot. A calendar
/// closed for longer is treated as having no further open time.
const MAX_CLOSED_SPAN_SECS: i64 = 31 * 24 * 60 * 60;

/// Daily session window in UTC. A window whose `end` is at or before its `start` wraps
/// past midnight and belongs to the trading date it started on; `start == end` is open all
/// day.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SessionWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SessionWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Build a window from hour and minute pairs, ignoring invalid times.
    pub fn hm(start: (u32, u32), end: (u32, u32)) -> Self {
        Self {
            start: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap_or(NaiveTime::MIN),
        }
    }

    fn wraps(&self) -> bool {
        self.end <= self.start
    }

    /// Trading date of `time` if it falls inside this window.
    fn trading_date(&self, time: DateTime<Utc>) -> Option<NaiveDate> {
        let date = time.date_naive();
        let clock = time.time();

        if self.start == self.end {
            return Some(date);
        }

        if !self.wraps() {
            return (self.start <= clock && clock < self.end).then_some(date);
        }

        if clock >= self.start {
            Some(date)
        } else if clock < self.end {
            date.pred_opt()
        } else {
            None
        }
    }
}

/// Trading session calendar expressed in UTC.
///
/// Windows are fixed UTC times and are not adjusted for daylight saving.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionCalendar {
    pub regular: SessionWindow,
    pub pre_market: Option<SessionWindow>,
    pub post_market: Option<SessionWindow>,
    pub weekdays: Vec<Weekday>,
    pub holidays: BTreeSet<NaiveDate>,
}

impl SessionCalendar {
    /// US equities: regular 14:30-21:00, pre-market 09:00-14:30, post-market 21:00-01:00
    /// UTC, Monday to Friday.
    pub fn us_equities() -> Self {
        Self {
            regular: SessionWindow::hm((14, 30), (21, 0)),
            pre_market: Some(SessionWindow::hm((9, 0), (14, 30))),
            post_market: Some(SessionWindow::hm((21, 0), (1, 0))),
            weekdays: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            holidays: BTreeSet::new(),
        }
    }

    /// Always open, every day of the week.
    pub fn continuous() -> Self {
        Self {
            regular: SessionWindow::new(NaiveTime::MIN, NaiveTime::MIN),
            pre_market: None,
            post_market: None,
            weekdays: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            holidays: BTreeSet::new(),
        }
    }

    pub fn with_holiday(mut self, date: NaiveDate) -> Self {
        self.holidays.insert(date);
        self
    }

    /// Determine if the calendar has any extended (pre or post market) session.
    pub fn has_extended(&self) -> bool {
        self.pre_market.is_some() || self.post_market.is_some()
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.weekdays.contains(&date.weekday()) && !self.holidays.contains(&date)
    }

    /// Session `time` falls into, or `None` if the market is closed.
    pub fn classify(&self, time: DateTime<Utc>) -> Option<Session> {
        let open = |window: &SessionWindow| {
            window
                .trading_date(time)
                .is_some_and(|date| self.is_trading_day(date))
        };

        if open(&self.regular) {
            Some(Session::Regular)
        } else if self.pre_market.iter().chain(self.post_market.iter()).any(open) {
            Some(Session::Extended)
        } else {
            None
        }
    }

    /// Generate up to `count` open time slots after `from`, stepping by `interval`.
    ///
    /// Extended session slots are only produced when `extended` is set. Intervals of a day
    /// or longer only check that the slot lands on a trading date. Fewer than `count` slots
    /// are returned only when the calendar stays closed for over a month (or the time range
    /// runs out), which is logged.
    pub fn slots_after(
        &self,
        from: DateTime<Utc>,
        interval: TimeDelta,
        count: usize,
        extended: bool,
    ) -> Vec<DateTime<Utc>> {
        if interval <= TimeDelta::zero() || count == 0 {
            return vec![];
        }

        let daily = interval >= TimeDelta::days(1);
        let max_closed_steps = closed_steps(interval);
        let mut slots = Vec::with_capacity(count);
        let mut cursor = from;
        let mut closed = 0;

        while slots.len() < count {
            let Some(next) = cursor.checked_add_signed(interval) else {
                warn!(
                    %from,
                    found = slots.len(),
                    requested = count,
                    "whitespace tail truncated at the end of the time range"
                );
                break;
            };
            cursor = next;

            let open = if daily {
                self.is_trading_day(cursor.date_naive())
            } else {
                match self.classify(cursor) {
                    Some(Session::Regular) => true,
                    Some(Session::Extended) => extended,
                    None => false,
                }
            };

            if open {
                slots.push(cursor);
                closed = 0;
                continue;
            }

            closed += 1;
            if closed > max_closed_steps {
                warn!(
                    %from,
                    interval_secs = interval.num_seconds(),
                    found = slots.len(),
                    requested = count,
                    "calendar closed for over a month, whitespace tail truncated"
                );
                break;
            }
        }

        slots
    }
}

/// Number of `interval` steps spanning [`MAX_CLOSED_SPAN_SECS`].
fn closed_steps(interval: TimeDelta) -> usize {
    let span = MAX_CLOSED_SPAN_SECS * 1000;
    let step = interval.num_milliseconds().max(1);
    usize::try_from(span / step).unwrap_or(usize::MAX).max(1)
}
