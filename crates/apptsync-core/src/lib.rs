//! Core domain model and local-calendar time utilities for apptsync.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Timelike, Utc, Weekday,
};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "apptsync-core";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid provider timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("provider record is missing field {0}")]
    MissingField(&'static str),
    #[error("provider record field {field} is malformed: {detail}")]
    MalformedField { field: &'static str, detail: String },
    #[error("unknown event action {0:?}")]
    UnknownAction(String),
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
    #[error("{action} event requires {missing}")]
    EventTimes {
        action: EventAction,
        missing: &'static str,
    },
}

/// The five classified appointment transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Schedule,
    Cancel,
    RescheduleSameDay,
    RescheduleIncoming,
    RescheduleOutgoing,
}

impl EventAction {
    pub const ALL: [EventAction; 5] = [
        EventAction::Schedule,
        EventAction::Cancel,
        EventAction::RescheduleSameDay,
        EventAction::RescheduleIncoming,
        EventAction::RescheduleOutgoing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventAction::Schedule => "schedule",
            EventAction::Cancel => "cancel",
            EventAction::RescheduleSameDay => "reschedule_same_day",
            EventAction::RescheduleIncoming => "reschedule_incoming",
            EventAction::RescheduleOutgoing => "reschedule_outgoing",
        }
    }

    pub fn requires_old_time(self) -> bool {
        !matches!(self, EventAction::Schedule)
    }

    pub fn requires_new_time(self) -> bool {
        !matches!(self, EventAction::Cancel)
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| CoreError::UnknownAction(s.to_string()))
    }
}

/// Locally known appointment, reconciled against the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub provider_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub is_canceled: Option<bool>,
    pub provider_created_at: DateTime<Utc>,
    pub provider_deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    /// Materialize a new local row from a provider record.
    pub fn from_provider(record: &ProviderAppointment, id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id,
            provider_id: record.provider_id,
            first_name: record.first_name.clone(),
            last_name: record.last_name.clone(),
            start_time: record.start_time.with_timezone(&Utc),
            duration_minutes: record.duration_minutes,
            is_canceled: Some(record.canceled),
            provider_created_at: record.created_at.with_timezone(&Utc),
            provider_deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn subject(&self) -> SimpleAppointment {
        SimpleAppointment {
            id: self.id,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
        }
    }
}

/// Immutable audit record of one classified transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub action: EventAction,
    pub created_at: DateTime<Utc>,
    pub old_time: Option<DateTime<Utc>>,
    pub new_time: Option<DateTime<Utc>>,
    pub appointment_id: Uuid,
}

/// Event awaiting persistence. Only constructible with times that match its action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    action: EventAction,
    old_time: Option<DateTime<Utc>>,
    new_time: Option<DateTime<Utc>>,
}

impl NewEvent {
    pub fn for_action(
        action: EventAction,
        old_time: Option<DateTime<Utc>>,
        new_time: Option<DateTime<Utc>>,
    ) -> Result<Self, CoreError> {
        if action.requires_old_time() && old_time.is_none() {
            return Err(CoreError::EventTimes {
                action,
                missing: "old_time",
            });
        }
        if action.requires_new_time() && new_time.is_none() {
            return Err(CoreError::EventTimes {
                action,
                missing: "new_time",
            });
        }
        Ok(Self {
            action,
            old_time: old_time.filter(|_| action.requires_old_time()),
            new_time: new_time.filter(|_| action.requires_new_time()),
        })
    }

    pub fn action(&self) -> EventAction {
        self.action
    }

    pub fn old_time(&self) -> Option<DateTime<Utc>> {
        self.old_time
    }

    pub fn new_time(&self) -> Option<DateTime<Utc>> {
        self.new_time
    }

    pub fn into_event(self, id: Uuid, appointment_id: Uuid, created_at: DateTime<Utc>) -> Event {
        Event {
            id,
            action: self.action,
            created_at,
            old_time: self.old_time,
            new_time: self.new_time,
            appointment_id,
        }
    }
}

/// Event joined with the subject name of its appointment, as read by the diff projector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub event: Event,
    pub first_name: String,
    pub last_name: String,
}

impl LoggedEvent {
    pub fn subject(&self) -> SimpleAppointment {
        SimpleAppointment {
            id: self.event.appointment_id,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
        }
    }
}

/// Immutable capture of one full provider listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub payload: JsonValue,
    pub content_hash: String,
    pub record_count: i32,
}

/// Parsed handoff contract from the provider client into the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAppointment {
    pub provider_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub start_time: DateTime<FixedOffset>,
    pub created_at: DateTime<FixedOffset>,
    pub duration_minutes: i32,
    pub canceled: bool,
    pub calendar_id: Option<i64>,
}

impl ProviderAppointment {
    /// Read the fields the engine needs from an Acuity-shaped record; everything else is ignored.
    pub fn from_json(value: &JsonValue) -> Result<Self, CoreError> {
        let provider_id = provider_id_of(value).ok_or(CoreError::MissingField("id"))?;
        let start_time = parse_provider_timestamp(required_str(value, "datetime")?)?;
        let created_at = match value.get("datetimeCreated").and_then(JsonValue::as_str) {
            Some(raw) => parse_provider_timestamp(raw)?,
            None => start_time,
        };
        let duration_minutes = match value.get("duration") {
            None | Some(JsonValue::Null) => 0,
            Some(raw) => json_i64(raw)
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| CoreError::MalformedField {
                    field: "duration",
                    detail: raw.to_string(),
                })?,
        };
        let canceled = match value.get("canceled") {
            None | Some(JsonValue::Null) => false,
            Some(JsonValue::Bool(flag)) => *flag,
            Some(other) => {
                return Err(CoreError::MalformedField {
                    field: "canceled",
                    detail: other.to_string(),
                })
            }
        };

        Ok(Self {
            provider_id,
            first_name: optional_str(value, "firstName"),
            last_name: optional_str(value, "lastName"),
            start_time,
            created_at,
            duration_minutes,
            canceled,
            calendar_id: value.get("calendarID").and_then(json_i64),
        })
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        self.start_time.with_timezone(&Utc)
    }
}

/// Provider id of a raw listing record, if readable. Accepts numbers and numeric strings.
pub fn provider_id_of(value: &JsonValue) -> Option<i64> {
    value.get("id").and_then(json_i64)
}

fn json_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn required_str<'a>(value: &'a JsonValue, field: &'static str) -> Result<&'a str, CoreError> {
    value
        .get(field)
        .and_then(JsonValue::as_str)
        .ok_or(CoreError::MissingField(field))
}

fn optional_str(value: &JsonValue, field: &str) -> String {
    value
        .get(field)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Parse provider timestamps such as `2025-06-03T19:00:00-0600` or RFC 3339.
pub fn parse_provider_timestamp(raw: &str) -> Result<DateTime<FixedOffset>, CoreError> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map_err(|_| CoreError::InvalidTimestamp(raw.to_string()))
}

/// One entry in an hourly diff bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleAppointment {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
}

/// Appointments added to / removed from one business hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyDiff {
    pub hour: String,
    pub added: Vec<SimpleAppointment>,
    #[serde(rename = "deleted")]
    pub removed: Vec<SimpleAppointment>,
}

impl HourlyDiff {
    pub fn empty(hour: u32) -> Self {
        Self {
            hour: hour_label(hour),
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

pub fn hour_label(hour: u32) -> String {
    format!("{hour:02}:00")
}

/// Source of "now". Injected so that "today" is deterministic under test.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Calendar-date arithmetic in the business's IANA zone.
///
/// Instants are always stored as UTC; this type is the only place where they are
/// projected onto local calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCalendar {
    tz: Tz,
}

impl LocalCalendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn from_name(name: &str) -> Result<Self, CoreError> {
        name.parse::<Tz>()
            .map(Self::new)
            .map_err(|_| CoreError::UnknownTimezone(name.to_string()))
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn date_of<T: TimeZone>(&self, instant: &DateTime<T>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        self.date_of(&now)
    }

    /// Calendar-date equality with today; not a rolling 24 hour window.
    pub fn is_today<T: TimeZone>(&self, instant: &DateTime<T>, now: DateTime<Utc>) -> bool {
        self.date_of(instant) == self.today(now)
    }

    /// `[local midnight, next local midnight)` for `date`, in UTC.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.resolve(date.and_time(NaiveTime::MIN));
        let next = date.succ_opt().unwrap_or(date);
        let end = self.resolve(next.and_time(NaiveTime::MIN));
        (start, end)
    }

    pub fn today_bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        self.day_bounds(self.today(now))
    }

    /// Local wall-clock time to UTC. Ambiguous times take the earlier instant; times skipped by a
    /// DST jump resolve to the first valid instant after the gap.
    pub fn resolve(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let mut probe = local;
        for _ in 0..4 {
            match self.tz.from_local_datetime(&probe) {
                LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => {
                    return t.with_timezone(&Utc)
                }
                LocalResult::None => probe += Duration::minutes(30),
            }
        }
        Utc.from_utc_datetime(&local)
    }

    pub fn local_hour<T: TimeZone>(&self, instant: &DateTime<T>) -> u32 {
        instant.with_timezone(&self.tz).hour()
    }

    /// Today's business window, or `None` on a closed day.
    pub fn business_window(&self, hours: &BusinessHours, now: DateTime<Utc>) -> Option<BusinessWindow> {
        let date = self.today(now);
        let day = hours.for_weekday(date.weekday());
        if day.is_closed() {
            return None;
        }
        let open = self.resolve(date.and_time(day.open));
        let close = self.resolve(date.and_time(day.close));
        let close_hour = if day.close.minute() > 0 {
            day.close.hour() + 1
        } else {
            day.close.hour()
        };
        let hours = (day.open.hour()..close_hour).collect();
        Some(BusinessWindow {
            date,
            open,
            close,
            hours,
        })
    }
}

/// Opening interval for one business day, plus the whole-hour bucket keys it spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessWindow {
    pub date: NaiveDate,
    pub open: DateTime<Utc>,
    pub close: DateTime<Utc>,
    pub hours: Vec<u32>,
}

/// Open/close wall-clock times for one weekday. `open == close` means closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    #[serde(with = "hh_mm")]
    pub open: NaiveTime,
    #[serde(with = "hh_mm")]
    pub close: NaiveTime,
}

impl DayHours {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Self {
        Self { open, close }
    }

    pub fn closed() -> Self {
        Self {
            open: NaiveTime::MIN,
            close: NaiveTime::MIN,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.open >= self.close
    }
}

/// Static per-weekday opening hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub monday: DayHours,
    pub tuesday: DayHours,
    pub wednesday: DayHours,
    pub thursday: DayHours,
    pub friday: DayHours,
    pub saturday: DayHours,
    pub sunday: DayHours,
}

impl Default for BusinessHours {
    fn default() -> Self {
        let hm = |h: u32, m: u32| NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);
        let weekday = DayHours::new(hm(16, 0), hm(20, 0));
        Self {
            monday: weekday,
            tuesday: weekday,
            wednesday: weekday,
            thursday: weekday,
            friday: DayHours::new(hm(16, 0), hm(19, 0)),
            saturday: DayHours::new(hm(10, 0), hm(13, 0)),
            sunday: DayHours::closed(),
        }
    }
}

impl BusinessHours {
    pub fn for_weekday(&self, weekday: Weekday) -> DayHours {
        match weekday {
            Weekday::Mon => self.monday,
            Weekday::Tue => self.tuesday,
            Weekday::Wed => self.wednesday,
            Weekday::Thu => self.thursday,
            Weekday::Fri => self.friday,
            Weekday::Sat => self.saturday,
            Weekday::Sun => self.sunday,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Weekday, DayHours)> + '_ {
        [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .map(|day| (day, self.for_weekday(day)))
    }
}

mod hh_mm {
    use super::*;

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn denver() -> LocalCalendar {
        LocalCalendar::from_name("America/Denver").unwrap()
    }

    fn at(raw: &str) -> DateTime<Utc> {
        parse_provider_timestamp(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parses_acuity_offsets_without_colon() {
        let ts = parse_provider_timestamp("2025-06-03T19:00:00-0600").unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-06-03T19:00:00-06:00");
        assert_eq!(
            parse_provider_timestamp("2025-06-03T19:00:00-06:00").unwrap(),
            ts
        );
        assert!(parse_provider_timestamp("June 3, 2025").is_err());
    }

    #[test]
    fn midnight_boundary_is_today_and_one_microsecond_before_is_not() {
        let cal = denver();
        let now = at("2025-04-24T09:00:00-0600");
        let (start, end) = cal.today_bounds(now);
        assert_eq!(start, at("2025-04-24T00:00:00-0600"));
        assert_eq!(end, at("2025-04-25T00:00:00-0600"));

        assert!(cal.is_today(&start, now));
        assert!(!cal.is_today(&(start - Duration::microseconds(1)), now));
        assert!(!cal.is_today(&end, now));
        assert!(cal.is_today(&(end - Duration::microseconds(1)), now));
    }

    #[test]
    fn today_uses_configured_zone_not_provider_offset() {
        let cal = denver();
        // 23:30 in Denver is already tomorrow in UTC.
        let now = at("2025-04-24T23:30:00-0600");
        assert_eq!(cal.today(now), NaiveDate::from_ymd_opt(2025, 4, 24).unwrap());
        // Same instant expressed with a foreign offset still lands on the Denver date.
        let foreign = parse_provider_timestamp("2025-04-25T01:30:00-0400").unwrap();
        assert!(cal.is_today(&foreign, now));
    }

    #[test]
    fn day_bounds_follow_dst_changes() {
        let cal = denver();
        let spring = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        let (start, end) = cal.day_bounds(spring);
        assert_eq!(end - start, Duration::hours(23));
    }

    #[test]
    fn business_window_for_thursday_has_four_buckets() {
        let cal = denver();
        let now = at("2025-04-24T09:00:00-0600");
        let window = cal.business_window(&BusinessHours::default(), now).unwrap();
        assert_eq!(window.hours, vec![16, 17, 18, 19]);
        assert_eq!(window.open, at("2025-04-24T16:00:00-0600"));
        assert_eq!(window.close, at("2025-04-24T20:00:00-0600"));
    }

    #[test]
    fn sunday_is_closed() {
        let cal = denver();
        let now = at("2025-04-27T12:00:00-0600");
        assert!(cal.business_window(&BusinessHours::default(), now).is_none());
    }

    #[test]
    fn business_hours_round_trip_through_hh_mm_strings() {
        let hours = BusinessHours::default();
        let value = serde_json::to_value(&hours).unwrap();
        assert_eq!(value["friday"], json!({"open": "16:00", "close": "19:00"}));
        let back: BusinessHours = serde_json::from_value(value).unwrap();
        assert_eq!(back, hours);
    }

    #[test]
    fn provider_record_parses_acuity_shape() {
        let raw = json!({
            "id": 1451596598,
            "firstName": "Meredith",
            "lastName": "Gray",
            "datetime": "2025-04-25T19:00:00-0600",
            "datetimeCreated": "2025-04-24T19:00:00-0600",
            "duration": "60",
            "calendarID": 1574840,
            "canceled": false,
            "type": "Tutor Session"
        });
        let record = ProviderAppointment::from_json(&raw).unwrap();
        assert_eq!(record.provider_id, 1451596598);
        assert_eq!(record.duration_minutes, 60);
        assert_eq!(record.calendar_id, Some(1574840));
        assert!(!record.canceled);
        assert_eq!(record.start_utc(), at("2025-04-26T01:00:00+0000"));
    }

    #[test]
    fn provider_record_without_datetime_is_rejected() {
        let raw = json!({"id": "42", "firstName": "No", "lastName": "Time"});
        assert_eq!(provider_id_of(&raw), Some(42));
        assert_eq!(
            ProviderAppointment::from_json(&raw),
            Err(CoreError::MissingField("datetime"))
        );
    }

    #[test]
    fn new_event_enforces_time_invariants() {
        let t = at("2025-04-24T16:00:00-0600");
        assert!(NewEvent::for_action(EventAction::Schedule, None, Some(t)).is_ok());
        assert!(NewEvent::for_action(EventAction::Schedule, None, None).is_err());
        assert!(NewEvent::for_action(EventAction::Cancel, Some(t), None).is_ok());
        assert!(NewEvent::for_action(EventAction::Cancel, None, None).is_err());
        assert!(NewEvent::for_action(EventAction::RescheduleSameDay, Some(t), None).is_err());

        let cancel = NewEvent::for_action(EventAction::Cancel, Some(t), Some(t)).unwrap();
        assert_eq!(cancel.new_time(), None);
    }

    #[test]
    fn event_action_names_round_trip() {
        for action in EventAction::ALL {
            assert_eq!(action.as_str().parse::<EventAction>().unwrap(), action);
            assert_eq!(
                serde_json::to_value(action).unwrap(),
                json!(action.as_str())
            );
        }
        assert!("rescheduled".parse::<EventAction>().is_err());
    }

    #[test]
    fn hourly_diff_serializes_removed_as_deleted() {
        let value = serde_json::to_value(HourlyDiff::empty(9)).unwrap();
        assert_eq!(value, json!({"hour": "09:00", "added": [], "deleted": []}));
    }
}
