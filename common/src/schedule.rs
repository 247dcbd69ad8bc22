use core::fmt;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Timelike};
use thiserror::Error;

use crate::types::Override;

pub const MIN_DURATION_HOURS: u8 = 1;
pub const MAX_DURATION_HOURS: u8 = 8;
pub const DEFAULT_DURATION_HOURS: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("hour {0} out of range (0-23)")]
    HourOutOfRange(u32),
    #[error("minute {0} out of range (0-59)")]
    MinuteOutOfRange(u32),
    #[error("duration {0} out of range (1-8)")]
    DurationOutOfRange(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self, ScheduleError> {
        if hour > 23 {
            return Err(ScheduleError::HourOutOfRange(hour));
        }
        if minute > 59 {
            return Err(ScheduleError::MinuteOutOfRange(minute));
        }
        Ok(Self {
            hour: hour as u8,
            minute: minute as u8,
        })
    }

    pub fn of(now: DateTime<FixedOffset>) -> Self {
        Self {
            hour: now.hour() as u8,
            minute: now.minute() as u8,
        }
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

pub fn validate_duration(hours: i64) -> Result<u8, ScheduleError> {
    if (MIN_DURATION_HOURS as i64..=MAX_DURATION_HOURS as i64).contains(&hours) {
        Ok(hours as u8)
    } else {
        Err(ScheduleError::DurationOutOfRange(hours))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    start: TimeOfDay,
    duration_hours: u8,
    override_mode: Override,
}

impl Schedule {
    pub fn new(start: TimeOfDay, duration_hours: u8) -> Result<Self, ScheduleError> {
        let duration_hours = validate_duration(duration_hours as i64)?;
        Ok(Self {
            start,
            duration_hours,
            override_mode: Override::None,
        })
    }

    pub fn starting_now(now: DateTime<FixedOffset>, duration_hours: u8) -> Self {
        Self {
            start: TimeOfDay::of(now),
            duration_hours: duration_hours.clamp(MIN_DURATION_HOURS, MAX_DURATION_HOURS),
            override_mode: Override::None,
        }
    }

    pub fn start(&self) -> TimeOfDay {
        self.start
    }

    pub fn duration_hours(&self) -> u8 {
        self.duration_hours
    }

    pub fn override_mode(&self) -> Override {
        self.override_mode
    }

    pub fn set_window(&mut self, start: TimeOfDay, duration_hours: i64) -> Result<(), ScheduleError> {
        self.duration_hours = validate_duration(duration_hours)?;
        self.start = start;
        Ok(())
    }

    pub fn set_override(&mut self, override_mode: Override) -> bool {
        let changed = self.override_mode != override_mode;
        self.override_mode = override_mode;
        changed
    }

    pub fn is_active(&self, now: DateTime<FixedOffset>) -> bool {
        match self.override_mode {
            Override::ForceOff => false,
            Override::ForceOn => true,
            Override::None => self.window_containing(now).is_some(),
        }
    }

    // yesterday's window may still be running past midnight
    pub fn window_containing(
        &self,
        now: DateTime<FixedOffset>,
    ) -> Option<(DateTime<FixedOffset>, DateTime<FixedOffset>)> {
        let today = now.date_naive();
        [Some(today), today.pred_opt()]
            .into_iter()
            .flatten()
            .filter_map(|date| self.window_on(date, now.offset()))
            .find(|(start, end)| *start <= now && now <= *end)
    }

    pub fn window_end(&self, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        self.window_containing(now).map(|(_, end)| end)
    }

    pub fn next_start(&self, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let today = now.date_naive();
        [Some(today), today.succ_opt()]
            .into_iter()
            .flatten()
            .filter_map(|date| self.window_on(date, now.offset()))
            .map(|(start, _)| start)
            .find(|start| *start > now)
    }

    fn window_on(
        &self,
        date: NaiveDate,
        offset: &FixedOffset,
    ) -> Option<(DateTime<FixedOffset>, DateTime<FixedOffset>)> {
        let naive = date.and_hms_opt(self.start.hour as u32, self.start.minute as u32, 0)?;
        let start = offset.from_local_datetime(&naive).single()?;
        Some((start, start + Duration::hours(self.duration_hours as i64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2026, 6, day, hour, minute, second)
            .unwrap()
    }

    fn window(hour: u32, minute: u32, duration: u8) -> Schedule {
        Schedule::new(TimeOfDay::new(hour, minute).unwrap(), duration).unwrap()
    }

    #[test]
    fn morning_window_example() {
        let schedule = window(8, 0, 3);

        assert!(schedule.is_active(at(10, 10, 0, 0)));
        assert!(!schedule.is_active(at(10, 11, 1, 0)));
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let schedule = window(8, 0, 3);

        assert!(!schedule.is_active(at(10, 7, 59, 59)));
        assert!(schedule.is_active(at(10, 8, 0, 0)));
        assert!(schedule.is_active(at(10, 11, 0, 0)));
        assert!(!schedule.is_active(at(10, 11, 0, 1)));
    }

    #[test]
    fn window_crossing_midnight_stays_active_next_day() {
        let schedule = window(22, 0, 4);

        assert!(!schedule.is_active(at(10, 21, 59, 0)));
        assert!(schedule.is_active(at(10, 23, 30, 0)));
        assert!(schedule.is_active(at(11, 1, 0, 0)));
        assert!(!schedule.is_active(at(11, 2, 30, 0)));
        assert_eq!(schedule.window_end(at(11, 1, 0, 0)), Some(at(11, 2, 0, 0)));
        assert_eq!(schedule.window_end(at(11, 2, 30, 0)), None);
    }

    #[test]
    fn every_duration_covers_its_hours() {
        for duration in MIN_DURATION_HOURS..=MAX_DURATION_HOURS {
            let schedule = window(20, 30, duration);
            let start = at(10, 20, 30, 0);

            for minutes in (0..duration as i64 * 60).step_by(17) {
                assert!(schedule.is_active(start + Duration::minutes(minutes)));
            }
            assert!(!schedule.is_active(start - Duration::seconds(1)));
            assert!(!schedule.is_active(
                start + Duration::hours(duration as i64) + Duration::seconds(1)
            ));
        }
    }

    #[test]
    fn override_takes_precedence_over_window() {
        let mut schedule = window(8, 0, 3);
        let inside = at(10, 9, 0, 0);
        let outside = at(10, 20, 0, 0);

        schedule.set_override(Override::ForceOn);
        assert!(schedule.is_active(outside));

        schedule.set_override(Override::ForceOff);
        assert!(!schedule.is_active(inside));

        schedule.set_override(Override::None);
        assert!(schedule.is_active(inside));
        assert!(!schedule.is_active(outside));
    }

    #[test]
    fn rejected_window_keeps_previous_values() {
        let mut schedule = window(8, 0, 3);

        let err = schedule
            .set_window(TimeOfDay::new(9, 15).unwrap(), 9)
            .unwrap_err();

        assert_eq!(err, ScheduleError::DurationOutOfRange(9));
        assert_eq!(schedule.start(), TimeOfDay::new(8, 0).unwrap());
        assert_eq!(schedule.duration_hours(), 3);
    }

    #[test]
    fn time_of_day_rejects_invalid_components() {
        assert_eq!(TimeOfDay::new(24, 0), Err(ScheduleError::HourOutOfRange(24)));
        assert_eq!(TimeOfDay::new(7, 60), Err(ScheduleError::MinuteOutOfRange(60)));
        assert_eq!(TimeOfDay::new(7, 5).unwrap().to_string(), "07:05");
    }

    #[test]
    fn next_start_rolls_to_tomorrow_after_todays_start() {
        let schedule = window(8, 0, 3);

        assert_eq!(schedule.next_start(at(10, 7, 0, 0)), Some(at(10, 8, 0, 0)));
        assert_eq!(schedule.next_start(at(10, 9, 0, 0)), Some(at(11, 8, 0, 0)));
    }

    #[test]
    fn starting_now_uses_current_minute() {
        let schedule = Schedule::starting_now(at(10, 14, 42, 13), DEFAULT_DURATION_HOURS);

        assert_eq!(schedule.start(), TimeOfDay::new(14, 42).unwrap());
        assert_eq!(schedule.duration_hours(), 3);
        assert_eq!(schedule.override_mode(), Override::None);
        assert!(schedule.is_active(at(10, 14, 43, 0)));
    }
}
