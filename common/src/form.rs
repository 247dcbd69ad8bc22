use chrono::{DateTime, FixedOffset};
use log::warn;
use thiserror::Error;

use crate::{
    ringlog::SharedLog,
    schedule::{validate_duration, Schedule, ScheduleError, TimeOfDay},
    signal::UpgradeFlag,
    store::{KeyValueStore, ScheduleStore},
    types::Override,
};

pub const MAX_FORM_BODY: usize = 512;
pub const MAX_RECV_RETRIES: usize = 5;

const TIME_SEPARATOR: &str = "%3A";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("malformed {field} {value:?}")]
    Malformed { field: &'static str, value: String },
    #[error(transparent)]
    OutOfRange(#[from] ScheduleError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BodyError {
    #[error("request body of {0} bytes exceeds 512")]
    TooLarge(usize),
    #[error("receive timed out {0} times in a row")]
    TimedOut(usize),
    #[error("receive failed: {0}")]
    Transport(String),
    #[error("connection closed after {received} of {expected} bytes")]
    Truncated { received: usize, expected: usize },
    #[error("request body is not utf-8")]
    NotUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvError {
    Timeout,
    Failed(String),
}

pub fn read_form_body<F>(content_len: usize, mut recv: F) -> Result<String, BodyError>
where
    F: FnMut(&mut [u8]) -> Result<usize, RecvError>,
{
    if content_len > MAX_FORM_BODY {
        return Err(BodyError::TooLarge(content_len));
    }

    let mut body = vec![0u8; content_len];
    let mut received = 0;
    let mut timeouts = 0;
    while received < content_len {
        match recv(&mut body[received..]) {
            Ok(0) => {
                return Err(BodyError::Truncated {
                    received,
                    expected: content_len,
                })
            }
            Ok(n) => {
                received += n.min(content_len - received);
                timeouts = 0;
            }
            Err(RecvError::Timeout) => {
                timeouts += 1;
                if timeouts > MAX_RECV_RETRIES {
                    return Err(BodyError::TimedOut(timeouts));
                }
            }
            Err(RecvError::Failed(reason)) => return Err(BodyError::Transport(reason)),
        }
    }

    String::from_utf8(body).map_err(|_| BodyError::NotUtf8)
}

pub fn body_value<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    body.split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == key)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

// HH%3AMM, a trailing %3ASS is dropped
pub fn decode_time_field(value: &str) -> Result<TimeOfDay, FieldError> {
    let malformed = || FieldError::Malformed {
        field: "stime",
        value: value.to_string(),
    };
    let mut parts = value.split(TIME_SEPARATOR);
    let hour = parts
        .next()
        .and_then(parse_component)
        .ok_or_else(malformed)?;
    let minute = parts
        .next()
        .and_then(parse_component)
        .ok_or_else(malformed)?;
    if let Some(seconds) = parts.next() {
        parse_component(seconds)
            .filter(|seconds| *seconds < 60)
            .ok_or_else(malformed)?;
    }
    if parts.next().is_some() {
        return Err(malformed());
    }
    Ok(TimeOfDay::new(hour, minute)?)
}

fn parse_component(text: &str) -> Option<u32> {
    if text.is_empty() || text.len() > 2 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

fn decode_duration(value: &str) -> Result<u8, FieldError> {
    let hours: i64 = value.parse().map_err(|_| FieldError::Malformed {
        field: "duration",
        value: value.to_string(),
    })?;
    Ok(validate_duration(hours)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    None,
    Upgrade,
    Reboot,
    Reset,
}

impl Command {
    fn from_body(body: &str) -> Self {
        if body.contains("command=upgrade") {
            Self::Upgrade
        } else if body.contains("command=reboot") {
            Self::Reboot
        } else if body.contains("command=reset") {
            Self::Reset
        } else {
            Self::None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Force {
    Unchanged,
    Clear,
    On,
    Off,
}

impl Force {
    fn from_body(body: &str) -> Self {
        match body_value(body, "force") {
            Some("on") => Self::On,
            Some("off") => Self::Off,
            Some("none") => Self::Clear,
            _ => Self::Unchanged,
        }
    }

    fn target(self) -> Option<Override> {
        match self {
            Self::Unchanged => None,
            Self::Clear => Some(Override::None),
            Self::On => Some(Override::ForceOn),
            Self::Off => Some(Override::ForceOff),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRequest {
    pub command: Command,
    pub force: Force,
    pub start_time: Result<TimeOfDay, FieldError>,
    pub duration: Result<u8, FieldError>,
}

impl ConfigRequest {
    pub fn parse(body: &str) -> Self {
        let start_time = body_value(body, "stime")
            .ok_or(FieldError::Missing("stime"))
            .and_then(decode_time_field);
        let duration = body_value(body, "duration")
            .ok_or(FieldError::Missing("duration"))
            .and_then(decode_duration);

        Self {
            command: Command::from_body(body),
            force: Force::from_body(body),
            start_time,
            duration,
        }
    }

    fn has_window_fields(&self) -> bool {
        !matches!(self.start_time, Err(FieldError::Missing(_)))
            || !matches!(self.duration, Err(FieldError::Missing(_)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigAction {
    Persist(Schedule),
    EraseStore,
    Restart,
    RequestUpgrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Rebooting,
    ConfigurationReset,
}

impl Notice {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rebooting => "Rebooting...",
            Self::ConfigurationReset => "Configuration reset",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOutcome {
    pub actions: Vec<ConfigAction>,
    pub notice: Option<Notice>,
}

pub fn apply_config(
    request: &ConfigRequest,
    schedule: &mut Schedule,
    now: DateTime<FixedOffset>,
    default_duration_hours: u8,
    log: &SharedLog,
) -> ConfigOutcome {
    let mut outcome = ConfigOutcome::default();

    match request.command {
        Command::Upgrade => {
            log.record("Firmware upgrade requested");
            outcome.actions.push(ConfigAction::RequestUpgrade);
            return outcome;
        }
        Command::Reboot => {
            log.record("Reboot requested");
            outcome.actions.push(ConfigAction::Restart);
            outcome.notice = Some(Notice::Rebooting);
            return outcome;
        }
        Command::Reset => {
            *schedule = Schedule::starting_now(now, default_duration_hours);
            log.clear();
            log.record(format!(
                "Configuration reset: start {}, duration {}h",
                schedule.start(),
                schedule.duration_hours()
            ));
            outcome.actions.push(ConfigAction::EraseStore);
            outcome.notice = Some(Notice::ConfigurationReset);
            return outcome;
        }
        Command::None => {}
    }

    if let Some(target) = request.force.target() {
        if schedule.set_override(target) {
            log.record(format!("Override set to {}", target.form_value()));
        }
    }

    if !request.has_window_fields() {
        return outcome;
    }

    match (&request.start_time, &request.duration) {
        (Ok(start), Ok(duration)) => match schedule.set_window(*start, *duration as i64) {
            Ok(()) => {
                log.record(format!("Start time {start}, duration {duration}h"));
                outcome.actions.push(ConfigAction::Persist(*schedule));
            }
            Err(err) => log.record(format!("Schedule unchanged: {err}")),
        },
        (Err(err), _) | (_, Err(err)) => log.record(format!("Schedule unchanged: {err}")),
    }

    outcome
}

pub fn execute_config_actions<S: KeyValueStore>(
    actions: Vec<ConfigAction>,
    store: &mut ScheduleStore<S>,
    upgrade: &UpgradeFlag,
    log: &SharedLog,
) -> bool {
    let mut restart = false;
    for action in actions {
        match action {
            ConfigAction::Persist(schedule) => {
                if let Err(err) = store.save(&schedule) {
                    warn!("failed to persist schedule: {err}");
                    log.record(format!("Saving settings failed: {err}"));
                }
            }
            ConfigAction::EraseStore => {
                if let Err(err) = store.erase() {
                    warn!("failed to erase settings: {err}");
                    log.record(format!("Erasing settings failed: {err}"));
                }
            }
            ConfigAction::RequestUpgrade => upgrade.request(),
            ConfigAction::Restart => restart = true,
        }
    }
    restart
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{test_support::FailingStore, MemoryStore};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2026, 5, 20, 13, 5, 0)
            .unwrap()
    }

    fn schedule() -> Schedule {
        Schedule::new(TimeOfDay::new(8, 0).unwrap(), 3).unwrap()
    }

    fn apply(body: &str, schedule: &mut Schedule, log: &SharedLog) -> ConfigOutcome {
        apply_config(&ConfigRequest::parse(body), schedule, now(), 3, log)
    }

    #[test]
    fn body_value_matches_whole_keys_only() {
        let body = "xstime=1&stime=09%3A30&duration=&force=on";

        assert_eq!(body_value(body, "stime"), Some("09%3A30"));
        assert_eq!(body_value(body, "duration"), None);
        assert_eq!(body_value(body, "time"), None);
        assert_eq!(body_value(body, "force"), Some("on"));
    }

    #[test]
    fn decode_time_field_accepts_only_encoded_colon() {
        assert_eq!(decode_time_field("07%3A45"), Ok(TimeOfDay::new(7, 45).unwrap()));
        assert!(matches!(
            decode_time_field("07:45"),
            Err(FieldError::Malformed { .. })
        ));
        assert!(matches!(
            decode_time_field("07%3a45"),
            Err(FieldError::Malformed { .. })
        ));
        assert_eq!(
            decode_time_field("25%3A00"),
            Err(FieldError::OutOfRange(ScheduleError::HourOutOfRange(25)))
        );
    }

    #[test]
    fn decode_time_field_drops_seconds() {
        assert_eq!(
            decode_time_field("07%3A45%3A30"),
            Ok(TimeOfDay::new(7, 45).unwrap())
        );
        assert!(matches!(
            decode_time_field("07%3A45%3A75"),
            Err(FieldError::Malformed { .. })
        ));
        assert!(matches!(
            decode_time_field("07%3A45%3A30%3A00"),
            Err(FieldError::Malformed { .. })
        ));
        assert!(matches!(
            decode_time_field("07%3A"),
            Err(FieldError::Malformed { .. })
        ));
    }

    #[test]
    fn valid_window_is_applied_and_persisted() {
        let log = SharedLog::new(16);
        let mut schedule = schedule();

        let outcome = apply("stime=09%3A30&duration=5&command=none", &mut schedule, &log);

        assert_eq!(schedule.start(), TimeOfDay::new(9, 30).unwrap());
        assert_eq!(schedule.duration_hours(), 5);
        assert_eq!(outcome.actions, vec![ConfigAction::Persist(schedule)]);
        assert_eq!(log.drain(), vec!["Start time 09:30, duration 5h"]);
    }

    #[test]
    fn duration_nine_is_rejected_and_logged() {
        let log = SharedLog::new(16);
        let mut schedule = schedule();

        let outcome = apply("stime=09%3A30&duration=9", &mut schedule, &log);

        assert_eq!(schedule, self::schedule());
        assert!(outcome.actions.is_empty());
        let lines = log.drain();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("duration 9"), "{lines:?}");
    }

    #[test]
    fn malformed_time_leaves_window_untouched() {
        let log = SharedLog::new(16);
        let mut schedule = schedule();

        apply("stime=garbage&duration=4", &mut schedule, &log);

        assert_eq!(schedule, self::schedule());
        assert_eq!(log.unread(), 1);
    }

    #[test]
    fn force_applies_even_when_fields_fail() {
        let log = SharedLog::new(16);
        let mut schedule = schedule();

        let outcome = apply("stime=&duration=0&force=off", &mut schedule, &log);

        assert_eq!(schedule.override_mode(), Override::ForceOff);
        assert_eq!(schedule.duration_hours(), 3);
        assert!(outcome.actions.is_empty());
    }

    #[test]
    fn force_none_clears_and_absent_force_keeps_override() {
        let log = SharedLog::new(16);
        let mut schedule = schedule();

        apply("force=on", &mut schedule, &log);
        assert_eq!(schedule.override_mode(), Override::ForceOn);

        apply("stime=08%3A00&duration=3", &mut schedule, &log);
        assert_eq!(schedule.override_mode(), Override::ForceOn);

        apply("force=none", &mut schedule, &log);
        assert_eq!(schedule.override_mode(), Override::None);
    }

    #[test]
    fn upgrade_command_only_requests_upgrade() {
        let log = SharedLog::new(16);
        let mut schedule = schedule();

        let outcome = apply("stime=10%3A00&duration=2&command=upgrade", &mut schedule, &log);

        assert_eq!(outcome.actions, vec![ConfigAction::RequestUpgrade]);
        assert_eq!(outcome.notice, None);
        assert_eq!(schedule, self::schedule());
    }

    #[test]
    fn reboot_command_restarts_with_notice() {
        let log = SharedLog::new(16);
        let mut schedule = schedule();

        let outcome = apply("command=reboot", &mut schedule, &log);

        assert_eq!(outcome.actions, vec![ConfigAction::Restart]);
        assert_eq!(outcome.notice, Some(Notice::Rebooting));
    }

    #[test]
    fn reset_command_defaults_schedule_and_wipes_log() {
        let log = SharedLog::new(16);
        log.record("old line");
        let mut schedule = schedule();
        schedule.set_override(Override::ForceOn);

        let outcome = apply("command=reset&force=on", &mut schedule, &log);

        assert_eq!(schedule.start(), TimeOfDay::new(13, 5).unwrap());
        assert_eq!(schedule.duration_hours(), 3);
        assert_eq!(schedule.override_mode(), Override::None);
        assert_eq!(outcome.actions, vec![ConfigAction::EraseStore]);
        assert_eq!(outcome.notice, Some(Notice::ConfigurationReset));
        assert_eq!(
            log.drain(),
            vec!["Configuration reset: start 13:05, duration 3h"]
        );
    }

    #[test]
    fn read_form_body_retries_timeouts() {
        let mut chunks = vec![
            Err(RecvError::Timeout),
            Ok(b"force=".to_vec()),
            Err(RecvError::Timeout),
            Ok(b"on".to_vec()),
        ]
        .into_iter();

        let body = read_form_body(8, |buf| {
            let chunk = chunks.next().unwrap_or(Err(RecvError::Failed("eof".into())))?;
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        });

        assert_eq!(body, Ok("force=on".to_string()));
    }

    #[test]
    fn read_form_body_gives_up() {
        assert_eq!(
            read_form_body(MAX_FORM_BODY + 1, |_| Ok(0)),
            Err(BodyError::TooLarge(MAX_FORM_BODY + 1))
        );
        assert_eq!(
            read_form_body(4, |_| Err(RecvError::Timeout)),
            Err(BodyError::TimedOut(MAX_RECV_RETRIES + 1))
        );
        assert_eq!(
            read_form_body(4, |_| Err(RecvError::Failed("reset by peer".into()))),
            Err(BodyError::Transport("reset by peer".into()))
        );
        assert_eq!(
            read_form_body(4, |_| Ok(0)),
            Err(BodyError::Truncated {
                received: 0,
                expected: 4
            })
        );
    }

    #[test]
    fn failed_save_keeps_new_window_in_memory_and_logs() {
        let log = SharedLog::new(16);
        let mut schedule = schedule();
        let mut store = ScheduleStore::new(FailingStore {
            inner: MemoryStore::new(),
            fail_on_write: Some(2),
            fail_commit: false,
            writes: 0,
            commits: 0,
        });

        let outcome = apply("stime=22%3A30&duration=6", &mut schedule, &log);
        let restart = execute_config_actions(outcome.actions, &mut store, &UpgradeFlag::new(), &log);

        assert!(!restart);
        assert_eq!(schedule.start(), TimeOfDay::new(22, 30).unwrap());
        assert_eq!(schedule.duration_hours(), 6);
        assert_eq!(
            log.drain(),
            vec![
                "Start time 22:30, duration 6h",
                "Saving settings failed: storage backend error: flash full",
            ]
        );
        assert_eq!(store.load(now(), 3).start(), TimeOfDay::new(13, 5).unwrap());
    }

    #[test]
    fn executed_actions_reach_store_and_flags() {
        let log = SharedLog::new(16);
        let upgrade = UpgradeFlag::new();
        let mut store = ScheduleStore::new(MemoryStore::new());
        let saved = Schedule::new(TimeOfDay::new(6, 0).unwrap(), 2).unwrap();

        let restart = execute_config_actions(
            vec![ConfigAction::Persist(saved), ConfigAction::RequestUpgrade],
            &mut store,
            &upgrade,
            &log,
        );

        assert!(!restart);
        assert!(upgrade.is_pending());
        assert_eq!(store.load(now(), 3), saved);
        assert_eq!(log.unread(), 0);

        let restart = execute_config_actions(
            vec![ConfigAction::EraseStore, ConfigAction::Restart],
            &mut store,
            &upgrade,
            &log,
        );

        assert!(restart);
        assert_eq!(store.load(now(), 3).start(), TimeOfDay::new(13, 5).unwrap());
    }
}
