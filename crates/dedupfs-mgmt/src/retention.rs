//! Snapshot retention planning.
//!
//! Given snapshot dates and a count of daily, weekly, monthly and yearly
//! slots, decides which dates survive a cleanup. Each family lays its slots
//! backward from `now`; a daily slot keeps its latest date, every wider slot
//! keeps its earliest.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid retention input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetentionError {
    /// Slot counts start at zero.
    #[error("{granularity} count must not be negative, got {value}")]
    Negative {
        /// Family being set
        granularity: Granularity,
        /// Rejected count
        value: i64,
    },
    /// Textual count that is not a whole number.
    #[error("{granularity} count must be an integer, got {value:?}")]
    NotAnInteger {
        /// Family being set
        granularity: Granularity,
        /// Rejected text
        value: String,
    },
    /// Family name other than daily, weekly, monthly or yearly.
    #[error("unknown retention granularity: {0}")]
    UnknownGranularity(String),
    /// Policy entry without `=`.
    #[error("malformed retention entry {0:?}, expected name=count")]
    Malformed(String),
}

/// A family of retention slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One-day slots
    Daily,
    /// Seven-day slots
    Weekly,
    /// Average-month slots
    Monthly,
    /// Average-year slots
    Yearly,
}

impl Granularity {
    /// Every family, narrowest first.
    pub const ALL: [Granularity; 4] = [
        Granularity::Daily,
        Granularity::Weekly,
        Granularity::Monthly,
        Granularity::Yearly,
    ];

    /// Slot width in seconds. Months and years are astronomical averages.
    pub fn seconds(self) -> i64 {
        match self {
            Granularity::Daily => 86_400,
            Granularity::Weekly => 604_800,
            Granularity::Monthly => 2_630_016,
            Granularity::Yearly => 31_557_600,
        }
    }

    /// Slot width.
    pub fn width(self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// Lowercase family name.
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
            Granularity::Weekly => "weekly",
            Granularity::Monthly => "monthly",
            Granularity::Yearly => "yearly",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = RetentionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" | "day" | "days" => Ok(Granularity::Daily),
            "weekly" | "week" | "weeks" => Ok(Granularity::Weekly),
            "monthly" | "month" | "months" => Ok(Granularity::Monthly),
            "yearly" | "year" | "years" => Ok(Granularity::Yearly),
            other => Err(RetentionError::UnknownGranularity(other.to_string())),
        }
    }
}

/// One retention slot: `[start, end]`, both ends inclusive, `end` one
/// microsecond before the next slot's start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// Family of the slot
    pub granularity: Granularity,
    /// Position counted back from `now`, 0 being the newest
    pub index: u32,
    /// First instant in the slot
    pub start: DateTime<Utc>,
    /// Last instant in the slot
    pub end: DateTime<Utc>,
}

impl Interval {
    /// Whether `date` falls in this slot.
    pub fn contains(&self, date: DateTime<Utc>) -> bool {
        date >= self.start && date <= self.end
    }

    /// Distance from `start` to `end`.
    pub fn width(&self) -> Duration {
        self.end - self.start
    }
}

/// Slots to keep per granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    daily: u32,
    weekly: u32,
    monthly: u32,
    yearly: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily: 7,
            weekly: 4,
            monthly: 2,
            yearly: 1,
        }
    }
}

impl RetentionPolicy {
    /// Policy with explicit slot counts.
    pub fn new(daily: u32, weekly: u32, monthly: u32, yearly: u32) -> Self {
        Self {
            daily,
            weekly,
            monthly,
            yearly,
        }
    }

    /// Slot count of one family.
    pub fn get(&self, granularity: Granularity) -> u32 {
        match granularity {
            Granularity::Daily => self.daily,
            Granularity::Weekly => self.weekly,
            Granularity::Monthly => self.monthly,
            Granularity::Yearly => self.yearly,
        }
    }

    /// Sets one slot count. Negative counts are rejected and leave the
    /// policy untouched; counts past `u32::MAX` are clamped.
    pub fn set(&mut self, granularity: Granularity, value: i64) -> Result<&mut Self, RetentionError> {
        if value < 0 {
            return Err(RetentionError::Negative { granularity, value });
        }
        let value = u32::try_from(value).unwrap_or(u32::MAX);
        match granularity {
            Granularity::Daily => self.daily = value,
            Granularity::Weekly => self.weekly = value,
            Granularity::Monthly => self.monthly = value,
            Granularity::Yearly => self.yearly = value,
        }
        Ok(self)
    }

    /// Like [`set`](Self::set) for textual input.
    pub fn set_str(&mut self, granularity: Granularity, value: &str) -> Result<&mut Self, RetentionError> {
        let parsed = value
            .trim()
            .parse::<i64>()
            .map_err(|_| RetentionError::NotAnInteger {
                granularity,
                value: value.to_string(),
            })?;
        self.set(granularity, parsed)
    }

    /// [`set`](Self::set) for the daily family.
    pub fn set_daily(&mut self, value: i64) -> Result<&mut Self, RetentionError> {
        self.set(Granularity::Daily, value)
    }

    /// [`set`](Self::set) for the weekly family.
    pub fn set_weekly(&mut self, value: i64) -> Result<&mut Self, RetentionError> {
        self.set(Granularity::Weekly, value)
    }

    /// [`set`](Self::set) for the monthly family.
    pub fn set_monthly(&mut self, value: i64) -> Result<&mut Self, RetentionError> {
        self.set(Granularity::Monthly, value)
    }

    /// [`set`](Self::set) for the yearly family.
    pub fn set_yearly(&mut self, value: i64) -> Result<&mut Self, RetentionError> {
        self.set(Granularity::Yearly, value)
    }

    /// Every slot of every family, anchored at `now`. A family ends early
    /// where its slots would reach past the oldest representable date.
    pub fn intervals(&self, now: DateTime<Utc>) -> Vec<Interval> {
        let mut out = Vec::new();
        for granularity in Granularity::ALL {
            out.extend(self.family(granularity, now));
        }
        out
    }

    fn family(&self, granularity: Granularity, now: DateTime<Utc>) -> impl Iterator<Item = Interval> {
        let tick = Duration::microseconds(1);
        let width = granularity.width();
        let mut upper = Some(now);
        (0..self.get(granularity)).map_while(move |index| {
            let end = upper?.checked_sub_signed(tick)?;
            let start = upper?.checked_sub_signed(width)?;
            upper = Some(start);
            Some(Interval {
                granularity,
                index,
                start,
                end,
            })
        })
    }

    /// Index of the `granularity` slot holding `date`, if the policy keeps
    /// that slot. Dates are compared at microsecond precision.
    pub fn slot_of(&self, granularity: Granularity, now: DateTime<Utc>, date: DateTime<Utc>) -> Option<u32> {
        let delta = now.signed_duration_since(date).num_microseconds()?;
        if delta <= 0 {
            return None;
        }
        let index = u32::try_from((delta - 1) / (granularity.seconds() * 1_000_000)).ok()?;
        if index >= self.get(granularity) {
            return None;
        }
        // The slot must be representable, as in `intervals`.
        let back = granularity
            .seconds()
            .checked_mul(i64::from(index) + 1)?
            .checked_mul(1_000_000)?;
        now.checked_sub_signed(Duration::microseconds(back))?;
        Some(index)
    }

    /// Splits `dates` into the ones to keep and the ones to remove.
    pub fn plan(&self, now: DateTime<Utc>, dates: &[DateTime<Utc>]) -> RetentionPlan {
        // Dates sharing a slot, per family.
        let mut groups: BTreeMap<(Granularity, u32), Vec<DateTime<Utc>>> = BTreeMap::new();
        for date in dates {
            for granularity in Granularity::ALL {
                if let Some(index) = self.slot_of(granularity, now, *date) {
                    groups.entry((granularity, index)).or_default().push(*date);
                }
            }
        }

        let mut kept = BTreeSet::new();
        for ((granularity, _), members) in &groups {
            let pick = if *granularity == Granularity::Daily {
                members.iter().max()
            } else {
                members.iter().min()
            };
            if let Some(date) = pick {
                kept.insert(*date);
            }
        }

        let remove = dates.iter().filter(|d| !kept.contains(*d)).copied().collect();
        RetentionPlan {
            keep: kept.into_iter().collect(),
            remove,
        }
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "daily={},weekly={},monthly={},yearly={}",
            self.daily, self.weekly, self.monthly, self.yearly
        )
    }
}

/// Parses `daily=7,weekly=4,...`. Omitted families keep their default.
impl FromStr for RetentionPolicy {
    type Err = RetentionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut policy = RetentionPolicy::default();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, value) = entry
                .split_once('=')
                .ok_or_else(|| RetentionError::Malformed(entry.to_string()))?;
            policy.set_str(name.parse()?, value)?;
        }
        Ok(policy)
    }
}

/// Outcome of [`RetentionPolicy::plan`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetentionPlan {
    /// Dates to keep, ascending, without duplicates
    pub keep: Vec<DateTime<Utc>>,
    /// Input dates not kept, in input order
    pub remove: Vec<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_default_policy() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.to_string(), "daily=7,weekly=4,monthly=2,yearly=1");
        assert_eq!(policy.intervals(at(2024, 1, 8)).len(), 14);
    }

    #[test]
    fn test_interval_arithmetic() {
        let now = at(2024, 1, 8);
        let intervals = RetentionPolicy::new(2, 1, 1, 1).intervals(now);
        let daily: Vec<&Interval> = intervals
            .iter()
            .filter(|i| i.granularity == Granularity::Daily)
            .collect();
        assert_eq!(daily[0].start, at(2024, 1, 7));
        assert_eq!(daily[0].end, at(2024, 1, 8) - Duration::microseconds(1));
        assert_eq!(daily[1].start, at(2024, 1, 6));
        assert_eq!(daily[1].end, daily[0].start - Duration::microseconds(1));

        let monthly = intervals
            .iter()
            .find(|i| i.granularity == Granularity::Monthly)
            .unwrap();
        assert_eq!(monthly.start, now - Duration::seconds(2_630_016));
        let yearly = intervals
            .iter()
            .find(|i| i.granularity == Granularity::Yearly)
            .unwrap();
        assert_eq!(yearly.start, Utc.with_ymd_and_hms(2023, 1, 7, 18, 0, 0).unwrap());
    }

    #[test]
    fn test_reference_scenario_keeps_all_four() {
        let now = at(2024, 1, 8);
        let dates = vec![at(2024, 1, 7), at(2024, 1, 1), at(2023, 12, 15), at(2023, 1, 10)];
        let plan = RetentionPolicy::new(7, 4, 2, 1).plan(now, &dates);

        // 01-07: daily slot 0. 01-01: daily slot 6 and earliest of weekly
        // slot 0. 12-15: earliest of weekly slot 3 and monthly slot 0.
        // 01-10: earliest of the yearly slot, which starts 2023-01-07T18:00.
        assert_eq!(
            plan.keep,
            vec![at(2023, 1, 10), at(2023, 12, 15), at(2024, 1, 1), at(2024, 1, 7)]
        );
        assert!(plan.remove.is_empty());
    }

    #[test]
    fn test_daily_keeps_latest_weekly_keeps_earliest() {
        let now = at(2024, 1, 8);
        let morning = at(2024, 1, 7) + Duration::hours(8);
        let evening = at(2024, 1, 7) + Duration::hours(20);
        let plan = RetentionPolicy::new(1, 0, 0, 0).plan(now, &[morning, evening]);
        assert_eq!(plan.keep, vec![evening]);
        assert_eq!(plan.remove, vec![morning]);

        let plan = RetentionPolicy::new(0, 1, 0, 0).plan(now, &[morning, evening]);
        assert_eq!(plan.keep, vec![morning]);
        assert_eq!(plan.remove, vec![evening]);
    }

    #[test]
    fn test_boundaries() {
        let now = at(2024, 1, 8);
        let policy = RetentionPolicy::new(1, 0, 0, 0);
        let last_tick = now - Duration::microseconds(1);
        assert!(policy.plan(now, &[now]).keep.is_empty());
        assert_eq!(policy.plan(now, &[last_tick]).keep, vec![last_tick]);
        assert_eq!(policy.plan(now, &[at(2024, 1, 7)]).keep, vec![at(2024, 1, 7)]);
        let before = at(2024, 1, 7) - Duration::microseconds(1);
        assert_eq!(policy.plan(now, &[before]).remove, vec![before]);
    }

    #[test]
    fn test_unmatched_dates_removed_in_input_order() {
        let now = at(2024, 1, 8);
        let old = [at(2010, 5, 1), at(2001, 1, 1), at(2015, 3, 3)];
        let plan = RetentionPolicy::default().plan(now, &old);
        assert!(plan.keep.is_empty());
        assert_eq!(plan.remove, old.to_vec());
    }

    #[test]
    fn test_empty_policy_removes_everything() {
        let now = at(2024, 1, 8);
        let plan = RetentionPolicy::new(0, 0, 0, 0).plan(now, &[at(2024, 1, 7)]);
        assert!(plan.keep.is_empty());
        assert_eq!(plan.remove.len(), 1);
    }

    #[test]
    fn test_setters_validate() {
        let mut policy = RetentionPolicy::default();
        assert_eq!(
            policy.set_daily(-1),
            Err(RetentionError::Negative {
                granularity: Granularity::Daily,
                value: -1
            })
        );
        assert_eq!(policy.get(Granularity::Daily), 7);
        assert!(matches!(
            policy.set_str(Granularity::Weekly, "2.5"),
            Err(RetentionError::NotAnInteger { .. })
        ));
        policy.set_monthly(6).unwrap().set_yearly(3).unwrap();
        assert_eq!(policy, RetentionPolicy::new(7, 4, 6, 3));
    }

    #[test]
    fn test_parse_policy() {
        let policy: RetentionPolicy = "daily=3, weekly=0,years=5".parse().unwrap();
        assert_eq!(policy, RetentionPolicy::new(3, 0, 2, 5));
        assert!(matches!(
            "hourly=3".parse::<RetentionPolicy>(),
            Err(RetentionError::UnknownGranularity(_))
        ));
        assert!(matches!(
            "daily".parse::<RetentionPolicy>(),
            Err(RetentionError::Malformed(_))
        ));
        assert!(matches!(
            "daily=x".parse::<RetentionPolicy>(),
            Err(RetentionError::NotAnInteger { .. })
        ));
    }

    #[test]
    fn test_huge_counts_plan_without_overflow() {
        let now = at(2024, 1, 8);
        let mut policy = RetentionPolicy::new(0, 0, 0, 0);
        policy.set_yearly(1_000_000).unwrap();
        let plan = policy.plan(now, &[at(2024, 1, 7)]);
        assert_eq!(plan.keep, vec![at(2024, 1, 7)]);

        let policy = RetentionPolicy::new(u32::MAX, u32::MAX, u32::MAX, u32::MAX);
        let dates = [DateTime::<Utc>::MIN_UTC, at(1, 1, 1), at(2023, 6, 1), now];
        let plan = policy.plan(now, &dates);
        assert!(plan.keep.contains(&at(1, 1, 1)));
        assert!(plan.keep.contains(&at(2023, 6, 1)));
        assert!(plan.remove.contains(&now));
        assert_eq!(plan.keep.len() + plan.remove.len(), dates.len());

        let plan = policy.plan(DateTime::<Utc>::MAX_UTC, &dates);
        assert_eq!(plan.keep.len() + plan.remove.len(), dates.len());
    }

    #[test]
    fn test_intervals_stop_at_oldest_date() {
        let now = at(2024, 1, 8);
        let yearly = RetentionPolicy::new(0, 0, 0, u32::MAX).intervals(now);
        assert!(!yearly.is_empty());
        assert!(yearly.len() < 300_000);
        let last = yearly.last().unwrap();
        assert!(last.start >= DateTime::<Utc>::MIN_UTC);
        assert!(last.start.checked_sub_signed(Granularity::Yearly.width()).is_none());
    }

    #[test]
    fn test_slot_of_agrees_with_intervals() {
        let now = at(2024, 1, 8);
        let policy = RetentionPolicy::new(9, 5, 3, 2);
        let intervals = policy.intervals(now);
        for hours in (0..3 * 365 * 24).step_by(7) {
            let date = now - Duration::hours(hours);
            for granularity in Granularity::ALL {
                let expected = intervals
                    .iter()
                    .find(|i| i.granularity == granularity && i.contains(date))
                    .map(|i| i.index);
                assert_eq!(policy.slot_of(granularity, now, date), expected, "{} {}", granularity, date);
            }
        }
    }

    fn slot_count() -> impl Strategy<Value = u32> {
        prop_oneof![0u32..10, 1_000_000u32..=u32::MAX, Just(u32::MAX)]
    }

    proptest! {
        #[test]
        fn prop_keep_and_remove_partition_input(
            offsets in proptest::collection::vec(0i64..(3 * 31_557_600), 0..40),
            ancient in proptest::collection::vec(-262_000i32..2024, 0..4),
            daily in slot_count(),
            weekly in slot_count(),
            monthly in slot_count(),
            yearly in slot_count(),
        ) {
            let now = at(2024, 1, 8);
            let mut dates: Vec<DateTime<Utc>> =
                offsets.iter().map(|s| now - Duration::seconds(*s)).collect();
            dates.extend(ancient.iter().map(|y| at(*y, 1, 1)));
            dates.push(DateTime::<Utc>::MIN_UTC);
            let plan = RetentionPolicy::new(daily, weekly, monthly, yearly).plan(now, &dates);

            let input: BTreeSet<_> = dates.iter().copied().collect();
            let keep: BTreeSet<_> = plan.keep.iter().copied().collect();
            let remove: BTreeSet<_> = plan.remove.iter().copied().collect();
            prop_assert!(keep.is_disjoint(&remove));
            let union: BTreeSet<_> = keep.union(&remove).copied().collect();
            prop_assert_eq!(union, input);
            prop_assert!(plan.keep.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
