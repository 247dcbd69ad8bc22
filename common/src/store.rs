use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use log::warn;
use thiserror::Error;

use crate::schedule::{Schedule, TimeOfDay};

pub const KEY_START_HOUR: &str = "time_hh";
pub const KEY_START_MINUTE: &str = "time_mm";
pub const KEY_DURATION: &str = "duration";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

pub trait KeyValueStore {
    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StoreError>;
    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError>;
    fn erase_all(&mut self) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: HashMap<String, i32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StoreError> {
        Ok(self.values.get(key).copied())
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), StoreError> {
        self.values.clear();
        Ok(())
    }
}

pub struct ScheduleStore<S> {
    backend: S,
}

impl<S: KeyValueStore> ScheduleStore<S> {
    pub fn new(backend: S) -> Self {
        Self { backend }
    }

    pub fn load(&mut self, now: DateTime<FixedOffset>, default_duration_hours: u8) -> Schedule {
        match self.try_load() {
            Ok(schedule) => schedule,
            Err(err) => {
                warn!("failed to load schedule, using defaults: {err}");
                Schedule::starting_now(now, default_duration_hours)
            }
        }
    }

    // a partial write is erased so a restart never loads mixed keys
    pub fn save(&mut self, schedule: &Schedule) -> Result<(), StoreError> {
        let result = self.write_window(schedule);
        if result.is_err() {
            if let Err(err) = self.backend.erase_all() {
                warn!("failed to erase partially saved schedule: {err}");
            }
        }
        result
    }

    pub fn erase(&mut self) -> Result<(), StoreError> {
        self.backend.erase_all()
    }

    fn write_window(&mut self, schedule: &Schedule) -> Result<(), StoreError> {
        let start = schedule.start();
        self.backend.set_i32(KEY_START_HOUR, start.hour() as i32)?;
        self.backend.set_i32(KEY_START_MINUTE, start.minute() as i32)?;
        self.backend
            .set_i32(KEY_DURATION, schedule.duration_hours() as i32)?;
        self.backend.commit()
    }

    fn try_load(&mut self) -> Result<Schedule, StoreError> {
        let hour = self.required(KEY_START_HOUR)?;
        let minute = self.required(KEY_START_MINUTE)?;
        let duration = self.required(KEY_DURATION)?;

        let start = TimeOfDay::new(non_negative(hour)?, non_negative(minute)?)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        let duration = u8::try_from(duration)
            .map_err(|_| StoreError::Corrupt(format!("duration {duration} out of range")))?;
        Schedule::new(start, duration).map_err(|err| StoreError::Corrupt(err.to_string()))
    }

    fn required(&mut self, key: &str) -> Result<i32, StoreError> {
        self.backend
            .get_i32(key)?
            .ok_or_else(|| StoreError::Corrupt(format!("missing key {key}")))
    }
}

fn non_negative(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative value {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::FailingStore;
    use crate::types::Override;
    use chrono::TimeZone;

    fn now() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(7200)
            .unwrap()
            .with_ymd_and_hms(2026, 7, 4, 16, 45, 0)
            .unwrap()
    }

    #[test]
    fn save_then_load_restores_window_without_override() {
        let mut store = ScheduleStore::new(MemoryStore::new());
        let mut schedule = Schedule::new(TimeOfDay::new(9, 30).unwrap(), 5).unwrap();
        schedule.set_override(Override::ForceOn);

        store.save(&schedule).unwrap();
        let loaded = store.load(now(), 3);

        assert_eq!(loaded.start(), TimeOfDay::new(9, 30).unwrap());
        assert_eq!(loaded.duration_hours(), 5);
        assert_eq!(loaded.override_mode(), Override::None);
    }

    #[test]
    fn empty_store_defaults_to_now() {
        let mut store = ScheduleStore::new(MemoryStore::new());

        let loaded = store.load(now(), 3);

        assert_eq!(loaded.start(), TimeOfDay::new(16, 45).unwrap());
        assert_eq!(loaded.duration_hours(), 3);
    }

    #[test]
    fn out_of_range_duration_defaults_everything() {
        let mut backend = MemoryStore::new();
        backend.set_i32(KEY_START_HOUR, 6).unwrap();
        backend.set_i32(KEY_START_MINUTE, 0).unwrap();
        backend.set_i32(KEY_DURATION, 12).unwrap();
        let mut store = ScheduleStore::new(backend);

        let loaded = store.load(now(), 3);

        assert_eq!(loaded.start(), TimeOfDay::new(16, 45).unwrap());
        assert_eq!(loaded.duration_hours(), 3);
    }

    #[test]
    fn erase_removes_persisted_window() {
        let mut store = ScheduleStore::new(MemoryStore::new());
        store
            .save(&Schedule::new(TimeOfDay::new(7, 0).unwrap(), 2).unwrap())
            .unwrap();

        store.erase().unwrap();

        assert_eq!(store.backend.values.len(), 0);
        assert_eq!(store.load(now(), 3).start(), TimeOfDay::new(16, 45).unwrap());
    }

    fn failing_on(write: usize) -> FailingStore {
        FailingStore {
            inner: MemoryStore::new(),
            fail_on_write: Some(write),
            fail_commit: false,
            writes: 0,
            commits: 0,
        }
    }

    #[test]
    fn failed_save_never_leaves_a_mixed_window() {
        let mut store = ScheduleStore::new(failing_on(5));
        store
            .save(&Schedule::new(TimeOfDay::new(8, 0).unwrap(), 3).unwrap())
            .unwrap();

        let err = store
            .save(&Schedule::new(TimeOfDay::new(22, 30).unwrap(), 6).unwrap())
            .unwrap_err();
        let loaded = store.load(now(), 3);

        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(loaded.start(), TimeOfDay::new(16, 45).unwrap());
        assert_eq!(loaded.duration_hours(), 3);
        assert!(store.backend.inner.values.is_empty());
    }

    #[test]
    fn save_commits_once_after_all_keys() {
        let mut store = ScheduleStore::new(failing_on(usize::MAX));

        store
            .save(&Schedule::new(TimeOfDay::new(6, 15).unwrap(), 4).unwrap())
            .unwrap();

        assert_eq!(store.backend.writes, 3);
        assert_eq!(store.backend.commits, 1);
    }

    #[test]
    fn failed_commit_erases_the_window() {
        let mut backend = failing_on(usize::MAX);
        backend.fail_commit = true;
        let mut store = ScheduleStore::new(backend);

        assert!(store
            .save(&Schedule::new(TimeOfDay::new(6, 15).unwrap(), 4).unwrap())
            .is_err());

        assert_eq!(store.load(now(), 3).start(), TimeOfDay::new(16, 45).unwrap());
    }
}
