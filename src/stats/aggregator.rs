//! Hierarchical time-bucketed hit/byte counters with hour/day/month/year
//! rollover (spec.md §4.8), ported from
//! `original_source/notify/stat.go:StatData.update`.

use std::collections::HashMap;

use chrono::{Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// One bucket: hits and bytes accumulated in some time window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counter {
    pub hits: u64,
    pub bytes: u64,
}

impl Counter {
    fn add(&mut self, other: Counter) {
        self.hits += other.hits;
        self.bytes += other.bytes;
    }
}

/// UTC calendar position a [`StatData`] was last updated at. `day` and
/// `month` are zero-indexed (day-of-month minus one, calendar month minus
/// one) to line up directly with the bucket array indices, mirroring the
/// original's `statTime`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatTime {
    pub hour: u32,
    pub day: u32,
    pub month: u32,
    pub year: i32,
}

impl StatTime {
    fn now() -> Self {
        let now = Utc::now();
        Self {
            hour: now.hour(),
            day: now.day() - 1,
            month: now.month() - 1,
            year: now.year(),
        }
    }

    /// Whether this date is the last day of its month.
    fn is_last_day(&self) -> bool {
        days_in_month(self.year, self.month + 1) == self.day + 1
    }
}

fn days_in_month(year: i32, month1: u32) -> u32 {
    let (next_year, next_month) = if month1 == 12 { (year + 1, 1) } else { (year, month1 + 1) };
    let first_of_next = chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("valid calendar date");
    let first_of_this =
        chrono::NaiveDate::from_ymd_opt(year, month1, 1).expect("valid calendar date");
    (first_of_next - first_of_this).num_days() as u32
}

/// Hour/day/month buckets for one rolling window (either the current one
/// or the immediately preceding one, see [`StatData::prev`]).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct History {
    pub hours: [Counter; 24],
    pub days: [Counter; 31],
    pub months: [Counter; 12],
}

impl Default for History {
    fn default() -> Self {
        Self {
            hours: [Counter::default(); 24],
            days: [Counter::default(); 31],
            months: [Counter::default(); 12],
        }
    }
}

/// A full hit/byte history: the rolling hour/day/month buckets, the
/// immediately preceding window's buckets (for "yesterday"/"last month"
/// style reporting), a running per-year total, and per-user-agent access
/// counts reset every month.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatData {
    pub date: StatTime,
    #[serde(flatten)]
    pub current: History,
    pub prev: History,
    pub years: HashMap<String, Counter>,
    pub accesses: HashMap<String, u64>,
}

impl StatData {
    /// Fold `counter` into the current hour bucket, rolling buckets
    /// forward first if real time has moved past the last recorded hour.
    pub fn record(&mut self, counter: Counter) {
        self.update_at(counter, StatTime::now());
    }

    fn update_at(&mut self, new_data: Counter, now: StatTime) {
        if self.date.year != 0 {
            if self.date.year != now.year {
                self.roll_year(now);
            } else if self.date.month != now.month {
                self.roll_month(now);
            } else if self.date.day != now.day {
                self.roll_day(now);
            } else if self.date.hour != now.hour {
                self.roll_hour(now);
            }
        }
        self.current.hours[now.hour as usize].add(new_data);
        self.date = now;
    }

    fn roll_year(&mut self, now: StatTime) {
        let iscont = now.year == self.date.year + 1;
        let is_month_cont =
            iscont && now.month == 0 && (self.date.month + 1) as usize == self.current.months.len();

        let mut inst = Counter::default();
        for i in 0..self.date.month as usize {
            inst.add(self.current.months[i]);
        }
        if iscont {
            for i in 0..=self.date.day as usize {
                inst.add(self.current.days[i]);
            }
            if is_month_cont {
                for i in 0..=self.date.hour as usize {
                    inst.add(self.current.hours[i]);
                }
            }
        }
        self.years.insert(self.date.year.to_string(), inst);

        if iscont {
            if is_month_cont {
                if now.day == 0 && self.date.is_last_day() {
                    self.prev.hours = self.current.hours;
                    for h in self.prev.hours.iter_mut().skip(self.date.hour as usize + 1) {
                        *h = Counter::default();
                    }
                } else {
                    self.prev.hours = [Counter::default(); 24];
                }
                self.current.hours = [Counter::default(); 24];

                self.prev.days = self.current.days;
                for d in self.prev.days.iter_mut().skip(self.date.day as usize + 1) {
                    *d = Counter::default();
                }
            } else {
                self.prev.days = [Counter::default(); 31];
            }
            self.current.days = [Counter::default(); 31];

            self.prev.months = self.current.months;
            for m in self.prev.months.iter_mut().skip(self.date.month as usize + 1) {
                *m = Counter::default();
            }
        } else {
            self.prev.months = [Counter::default(); 12];
        }
        self.current.months = [Counter::default(); 12];
    }

    fn roll_month(&mut self, now: StatTime) {
        let iscont = now.month == self.date.month + 1;

        let mut inst = Counter::default();
        for i in 0..self.date.day as usize {
            inst.add(self.current.days[i]);
        }
        if iscont {
            for i in 0..=self.date.hour as usize {
                inst.add(self.current.hours[i]);
            }
        }
        self.current.months[self.date.month as usize] = inst;
        for i in (self.date.month as usize + 1)..(now.month as usize) {
            self.current.months[i] = Counter::default();
        }
        self.accesses.clear();

        if iscont {
            if now.day == 0 && self.date.is_last_day() {
                self.prev.hours = self.current.hours;
                for h in self.prev.hours.iter_mut().skip(self.date.hour as usize + 1) {
                    *h = Counter::default();
                }
            } else {
                self.prev.hours = [Counter::default(); 24];
            }
            self.current.hours = [Counter::default(); 24];

            self.prev.days = self.current.days;
            for d in self.prev.days.iter_mut().skip(self.date.day as usize + 1) {
                *d = Counter::default();
            }
        } else {
            self.prev.days = [Counter::default(); 31];
        }
        self.current.days = [Counter::default(); 31];
    }

    fn roll_day(&mut self, now: StatTime) {
        let mut inst = Counter::default();
        for i in 0..=self.date.hour as usize {
            inst.add(self.current.hours[i]);
        }
        self.current.days[self.date.day as usize] = inst;
        for i in (self.date.day as usize + 1)..(now.day as usize) {
            self.current.days[i] = Counter::default();
        }

        if now.day == self.date.day + 1 {
            self.prev.hours = self.current.hours;
            for h in self.prev.hours.iter_mut().skip(self.date.hour as usize + 1) {
                *h = Counter::default();
            }
        } else {
            self.prev.hours = [Counter::default(); 24];
        }
        self.current.hours = [Counter::default(); 24];
    }

    fn roll_hour(&mut self, now: StatTime) {
        for i in (self.date.hour as usize + 1)..(now.hour as usize) {
            self.current.hours[i] = Counter::default();
        }
    }
}

/// Canonicalize a User-Agent string to the per-agent bucket key: truncate
/// at the first space, then at the first `/` (so `rust-client/1.2 extra`
/// and `rust-client/1.2` fold together); empty collapses to `[Unknown]`.
pub fn canonicalize_ua(ua: &str) -> String {
    let head = ua.split(' ').next().unwrap_or("");
    let head = head.split('/').next().unwrap_or("");
    if head.is_empty() {
        "[Unknown]".to_string()
    } else {
        head.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(year: i32, month1: u32, day1: u32, hour: u32) -> StatTime {
        StatTime {
            hour,
            day: day1 - 1,
            month: month1 - 1,
            year,
        }
    }

    #[test]
    fn first_record_just_sets_the_hour_bucket() {
        let mut data = StatData::default();
        data.update_at(Counter { hits: 1, bytes: 100 }, at(2026, 1, 1, 5));
        assert_eq!(data.current.hours[5], Counter { hits: 1, bytes: 100 });
        assert_eq!(data.date, at(2026, 1, 1, 5));
    }

    #[test]
    fn same_hour_accumulates() {
        let mut data = StatData::default();
        data.update_at(Counter { hits: 1, bytes: 10 }, at(2026, 1, 1, 5));
        data.update_at(Counter { hits: 2, bytes: 20 }, at(2026, 1, 1, 5));
        assert_eq!(data.current.hours[5], Counter { hits: 3, bytes: 30 });
    }

    #[test]
    fn hour_rollover_folds_into_day_bucket_is_deferred_until_day_changes() {
        let mut data = StatData::default();
        data.update_at(Counter { hits: 1, bytes: 10 }, at(2026, 1, 1, 5));
        data.update_at(Counter { hits: 1, bytes: 10 }, at(2026, 1, 1, 6));
        // Hour 5's data is still sitting in the hours bucket, not yet
        // folded into days -- only a day/month/year rollover does that.
        assert_eq!(data.current.hours[5], Counter { hits: 1, bytes: 10 });
        assert_eq!(data.current.hours[6], Counter { hits: 1, bytes: 10 });
    }

    #[test]
    fn day_rollover_folds_hours_into_days_and_sets_prev() {
        let mut data = StatData::default();
        data.update_at(Counter { hits: 1, bytes: 10 }, at(2026, 1, 1, 23));
        data.update_at(Counter { hits: 1, bytes: 5 }, at(2026, 1, 2, 0));
        assert_eq!(data.current.days[0], Counter { hits: 1, bytes: 10 });
        assert_eq!(data.prev.hours[23], Counter { hits: 1, bytes: 10 });
        assert_eq!(data.current.hours[0], Counter { hits: 1, bytes: 5 });
    }

    #[test]
    fn month_rollover_clears_accesses_and_folds_days() {
        let mut data = StatData::default();
        data.accesses.insert("agent-a".to_string(), 7);
        data.update_at(Counter { hits: 1, bytes: 10 }, at(2026, 1, 31, 23));
        data.update_at(Counter { hits: 1, bytes: 5 }, at(2026, 2, 1, 0));
        assert!(data.accesses.is_empty());
        assert_eq!(data.current.months[0].hits, 1);
    }

    #[test]
    fn year_rollover_snapshots_into_years_map() {
        let mut data = StatData::default();
        data.update_at(Counter { hits: 1, bytes: 10 }, at(2025, 12, 31, 23));
        data.update_at(Counter { hits: 1, bytes: 5 }, at(2026, 1, 1, 0));
        assert_eq!(data.years.get("2025").unwrap().hits, 1);
    }

    #[test]
    fn canonicalizes_ua_at_first_space_then_slash() {
        assert_eq!(canonicalize_ua("rust-client/1.2 extra stuff"), "rust-client");
        assert_eq!(canonicalize_ua("rust-client/1.2"), "rust-client");
        assert_eq!(canonicalize_ua(""), "[Unknown]");
    }
}
