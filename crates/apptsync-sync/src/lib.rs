//! Webhook classification, snapshot reconciliation and hourly diff projection.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use apptsync_core::{
    provider_id_of, Appointment, BusinessHours, BusinessWindow, Clock, Event, EventAction,
    HourlyDiff, LocalCalendar, LoggedEvent, NewEvent, ProviderAppointment,
};
use apptsync_provider::{AcuityConfig, BackoffPolicy, ProviderClient, ProviderError};
use apptsync_storage::{AppointmentStore, EventWindow, Mutation, ReconcilePlan, StoreError};
use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "apptsync-sync";

pub const DEFAULT_TIMEZONE: &str = "America/Denver";

pub const BUSINESS_HOURS_FILE: &str = "business_hours.yaml";

/// Provider webhook actions that trigger classification.
pub const VALID_ACTIONS: [&str; 5] = [
    "scheduled",
    "rescheduled",
    "canceled",
    "changed",
    "order.completed",
];

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub acuity_base_url: String,
    pub acuity_user_id: String,
    pub acuity_api_key: String,
    pub acuity_calendar_id: Option<i64>,
    pub calendar: LocalCalendar,
    pub api_key: Option<String>,
    pub web_port: u16,
    pub http_timeout_secs: u64,
    pub listing_limit: usize,
    pub listing_today_only: bool,
    pub snapshot_lead_minutes: i64,
    pub scheduler_enabled: bool,
    pub workspace_root: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let flag = |key: &str, default: bool| {
            var(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(default)
        };

        let timezone = var("APPTSYNC_TIMEZONE").unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        let calendar = LocalCalendar::from_name(&timezone)
            .with_context(|| format!("parsing APPTSYNC_TIMEZONE={timezone}"))?;

        Ok(Self {
            database_url: var("DATABASE_URL"),
            acuity_base_url: var("ACUITY_BASE_URL")
                .unwrap_or_else(|| apptsync_provider::DEFAULT_ACUITY_BASE_URL.to_string()),
            acuity_user_id: var("ACUITY_USER_ID").unwrap_or_default(),
            acuity_api_key: var("ACUITY_API_KEY").unwrap_or_default(),
            acuity_calendar_id: var("ACUITY_CALENDAR_ID")
                .map(|v| parse_value::<i64>("ACUITY_CALENDAR_ID", &v))
                .transpose()?,
            calendar,
            api_key: var("APPTSYNC_API_KEY"),
            web_port: parse_or("APPTSYNC_WEB_PORT", var("APPTSYNC_WEB_PORT"), 8000)?,
            http_timeout_secs: parse_or(
                "APPTSYNC_HTTP_TIMEOUT_SECS",
                var("APPTSYNC_HTTP_TIMEOUT_SECS"),
                20,
            )?,
            listing_limit: parse_or("APPTSYNC_LISTING_LIMIT", var("APPTSYNC_LISTING_LIMIT"), 100)?,
            listing_today_only: flag("APPTSYNC_LISTING_TODAY_ONLY", true),
            snapshot_lead_minutes: parse_or(
                "APPTSYNC_SNAPSHOT_LEAD_MINUTES",
                var("APPTSYNC_SNAPSHOT_LEAD_MINUTES"),
                30,
            )?,
            scheduler_enabled: flag("APPTSYNC_SCHEDULER_ENABLED", false),
            workspace_root: var("APPTSYNC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        })
    }

    pub fn acuity_config(&self) -> AcuityConfig {
        AcuityConfig {
            base_url: self.acuity_base_url.clone(),
            user_id: self.acuity_user_id.clone(),
            api_key: self.acuity_api_key.clone(),
            calendar_id: self.acuity_calendar_id,
            timeout: StdDuration::from_secs(self.http_timeout_secs),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn snapshot_lead(&self) -> Duration {
        Duration::minutes(self.snapshot_lead_minutes)
    }

    pub fn business_hours_path(&self) -> PathBuf {
        self.workspace_root.join(BUSINESS_HOURS_FILE)
    }

    /// Opening hours from `business_hours.yaml` under the workspace root, or the built-in week.
    pub async fn load_business_hours(&self) -> Result<BusinessHours> {
        let path = self.business_hours_path();
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(BusinessHours::default());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("parsing {key}={raw}"))
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.map(|v| parse_value(key, &v))
        .transpose()
        .map(|v| v.unwrap_or(default))
}

/// Collaborators shared by every sync component.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn AppointmentStore>,
    pub provider: Arc<dyn ProviderClient>,
    pub clock: Arc<dyn Clock>,
    pub calendar: LocalCalendar,
}

impl SyncContext {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        provider: Arc<dyn ProviderClient>,
        clock: Arc<dyn Clock>,
        calendar: LocalCalendar,
    ) -> Self {
        Self {
            store,
            provider,
            clock,
            calendar,
        }
    }
}

/// Form body posted by the provider when an appointment changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookNotification {
    pub action: String,
    pub id: i64,
    #[serde(rename = "calendarID", default, deserialize_with = "blank_as_none")]
    pub calendar_id: Option<i64>,
    #[serde(rename = "appointmentTypeID", default, deserialize_with = "blank_as_none")]
    pub appointment_type_id: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(i64),
    Text(String),
}

// Form posts carry `calendarID=` when the field is unset.
fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(value)) => Ok(Some(value)),
        Some(NumberOrText::Text(text)) => match text.trim() {
            "" => Ok(None),
            trimmed => trimmed.parse().map(Some).map_err(serde::de::Error::custom),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PassReason {
    UnknownAction { action: String },
    CalendarMismatch { expected: i64, received: Option<i64> },
    NotToday { provider_id: i64 },
}

impl PassReason {
    pub fn message(&self) -> String {
        match self {
            PassReason::UnknownAction { action } => {
                format!("Webhook action {action:?} is not handled")
            }
            PassReason::CalendarMismatch { expected, received } => match received {
                Some(received) => {
                    format!("Calendar {received} does not match configured calendar {expected}")
                }
                None => format!("Notification has no calendar; expected {expected}"),
            },
            PassReason::NotToday { provider_id } => {
                format!("Appointment {provider_id} doesn't deal with today")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifyOutcome {
    Applied(Event),
    Passed(PassReason),
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("fetching provider appointment failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("storing transition failed: {0}")]
    Store(#[source] StoreError),
    #[error("unexpected local state: {0}")]
    UnexpectedState(String),
}

impl ClassifyError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClassifyError::Provider(err) => err.is_retryable(),
            ClassifyError::Store(StoreError::Conflict(_)) => true,
            ClassifyError::Store(_) | ClassifyError::UnexpectedState(_) => false,
        }
    }
}

/// The four observations the decision table depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionFacts {
    pub local_exists: bool,
    pub provider_today: bool,
    pub provider_canceled: bool,
    pub local_today: bool,
}

/// First-match decision table. `None` means nothing about the change concerns today.
pub fn decide(facts: TransitionFacts) -> Option<EventAction> {
    match facts {
        TransitionFacts {
            local_exists: false,
            provider_today: false,
            ..
        } => None,
        TransitionFacts {
            local_exists: false,
            provider_today: true,
            ..
        } => Some(EventAction::Schedule),
        TransitionFacts {
            provider_canceled: true,
            ..
        } => Some(EventAction::Cancel),
        TransitionFacts {
            provider_today: true,
            local_today: true,
            ..
        } => Some(EventAction::RescheduleSameDay),
        TransitionFacts {
            provider_today: true,
            local_today: false,
            ..
        } => Some(EventAction::RescheduleIncoming),
        TransitionFacts {
            provider_today: false,
            ..
        } => Some(EventAction::RescheduleOutgoing),
    }
}

/// Turns provider change notifications into one local mutation plus one audit event.
#[derive(Clone)]
pub struct Classifier {
    ctx: SyncContext,
    expected_calendar_id: Option<i64>,
}

impl Classifier {
    pub fn new(ctx: SyncContext, expected_calendar_id: Option<i64>) -> Self {
        Self {
            ctx,
            expected_calendar_id,
        }
    }

    pub async fn handle_notification(
        &self,
        notification: &WebhookNotification,
    ) -> Result<ClassifyOutcome, ClassifyError> {
        if !VALID_ACTIONS.contains(&notification.action.as_str()) {
            debug!(action = %notification.action, "ignoring webhook action");
            return Ok(ClassifyOutcome::Passed(PassReason::UnknownAction {
                action: notification.action.clone(),
            }));
        }
        self.classify_and_apply(notification.id, notification.calendar_id)
            .await
    }

    pub async fn classify_and_apply(
        &self,
        provider_id: i64,
        calendar_id: Option<i64>,
    ) -> Result<ClassifyOutcome, ClassifyError> {
        if let Some(expected) = self.expected_calendar_id {
            if calendar_id != Some(expected) {
                return Ok(ClassifyOutcome::Passed(PassReason::CalendarMismatch {
                    expected,
                    received: calendar_id,
                }));
            }
        }

        let span = info_span!("classify", provider_id);
        self.classify_inner(provider_id).instrument(span).await
    }

    async fn classify_inner(&self, provider_id: i64) -> Result<ClassifyOutcome, ClassifyError> {
        let remote = self.ctx.provider.fetch_appointment(provider_id).await?;
        let local = self
            .ctx
            .store
            .find_by_provider_id(provider_id)
            .await
            .map_err(ClassifyError::Store)?;

        let now = self.ctx.clock.now();
        let calendar = &self.ctx.calendar;
        let facts = TransitionFacts {
            local_exists: local.is_some(),
            provider_today: calendar.is_today(&remote.start_time, now),
            provider_canceled: remote.canceled,
            local_today: local
                .as_ref()
                .is_some_and(|appt| calendar.is_today(&appt.start_time, now)),
        };

        let Some(action) = decide(facts) else {
            info!(provider_id, "appointment does not touch today; passed");
            return Ok(ClassifyOutcome::Passed(PassReason::NotToday { provider_id }));
        };

        let (mutation, old_time, new_time) = transition_for(action, local.as_ref(), &remote, now)?;
        let event = NewEvent::for_action(action, old_time, new_time)
            .map_err(|err| ClassifyError::UnexpectedState(err.to_string()))?;

        match self.ctx.store.apply_transition(mutation, event, now).await {
            Ok((appointment, event)) => {
                info!(
                    provider_id,
                    appointment_id = %appointment.id,
                    action = %event.action,
                    "classified appointment change"
                );
                Ok(ClassifyOutcome::Applied(event))
            }
            Err(StoreError::NotFound { entity, id }) => {
                let detail = format!(
                    "{entity} {id} vanished before {action} for provider id {provider_id} could be applied"
                );
                error!(provider_id, ?facts, %action, "{detail}");
                Err(ClassifyError::UnexpectedState(detail))
            }
            Err(err) => Err(ClassifyError::Store(err)),
        }
    }
}

type Transition = (
    Mutation,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

fn transition_for(
    action: EventAction,
    local: Option<&Appointment>,
    remote: &ProviderAppointment,
    now: DateTime<Utc>,
) -> Result<Transition, ClassifyError> {
    let provider_start = remote.start_utc();
    if action == EventAction::Schedule {
        let appointment = Appointment::from_provider(remote, Uuid::new_v4(), now);
        return Ok((Mutation::Create(appointment), None, Some(provider_start)));
    }

    let local = local.ok_or_else(|| {
        ClassifyError::UnexpectedState(format!(
            "{action} chosen for provider id {} without a local appointment",
            remote.provider_id
        ))
    })?;
    let mutation = match action {
        EventAction::Cancel => Mutation::MarkCanceled {
            appointment_id: local.id,
        },
        _ => Mutation::UpdateStart {
            appointment_id: local.id,
            start_time: provider_start,
        },
    };
    Ok((mutation, Some(local.start_time), Some(provider_start)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub snapshot_id: Uuid,
    pub total: usize,
    pub deleted: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("fetching provider listing failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("reconciling store failed: {0}")]
    Store(#[from] StoreError),
}

/// Full-listing sweep that removes today's appointments the provider no longer knows about.
#[derive(Clone)]
pub struct Reconciler {
    ctx: SyncContext,
    listing_limit: usize,
    today_only: bool,
}

impl Reconciler {
    pub fn new(ctx: SyncContext, listing_limit: usize, today_only: bool) -> Self {
        Self {
            ctx,
            listing_limit,
            today_only,
        }
    }

    pub async fn reconcile_snapshot(&self) -> Result<ReconcileSummary, ReconcileError> {
        let span = info_span!("reconcile_snapshot", limit = self.listing_limit);
        self.reconcile_inner().instrument(span).await
    }

    async fn reconcile_inner(&self) -> Result<ReconcileSummary, ReconcileError> {
        let now = self.ctx.clock.now();
        let today = self.ctx.calendar.today(now);
        let (delete_from, delete_until) = self.ctx.calendar.day_bounds(today);

        let listing = self
            .ctx
            .provider
            .fetch_listing(self.today_only.then_some(today), self.listing_limit)
            .await?;
        if self.listing_limit > 0 && listing.len() >= self.listing_limit {
            warn!(
                records = listing.len(),
                "provider listing reached the request limit and may be truncated"
            );
        }

        let snapshot = self
            .ctx
            .store
            .insert_snapshot(&JsonValue::Array(listing.clone()), now)
            .await?;

        let present_provider_ids: HashSet<i64> = listing.iter().filter_map(provider_id_of).collect();
        let mut upserts = Vec::with_capacity(listing.len());
        let mut skipped = 0;
        for (index, record) in listing.iter().enumerate() {
            match ProviderAppointment::from_json(record) {
                Ok(parsed) => upserts.push(parsed),
                Err(err) => {
                    skipped += 1;
                    warn!(
                        index,
                        provider_id = provider_id_of(record),
                        error = %err,
                        "skipping malformed listing record"
                    );
                }
            }
        }

        let counts = self
            .ctx
            .store
            .apply_reconciliation(ReconcilePlan {
                present_provider_ids,
                delete_from,
                delete_until,
                upserts,
                now,
            })
            .await?;
        for provider_id in &counts.deleted_provider_ids {
            info!(provider_id, "deleted appointment missing from provider listing");
        }

        let summary = ReconcileSummary {
            snapshot_id: snapshot.id,
            total: listing.len(),
            deleted: counts.deleted(),
            created: counts.created,
            updated: counts.updated,
            skipped,
        };
        info!(
            total = summary.total,
            deleted = summary.deleted,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            "snapshot reconciled"
        );
        Ok(summary)
    }
}

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("reading event log failed: {0}")]
    Store(#[from] StoreError),
}

/// Read-side projection of today's event log into per-hour added/removed buckets.
#[derive(Clone)]
pub struct DiffProjector {
    ctx: SyncContext,
    hours: BusinessHours,
    lookback: Duration,
}

impl DiffProjector {
    pub fn new(ctx: SyncContext, hours: BusinessHours, lookback: Duration) -> Self {
        Self {
            ctx,
            hours,
            lookback,
        }
    }

    pub async fn project_daily_diff(&self) -> Result<Vec<HourlyDiff>, ProjectError> {
        let now = self.ctx.clock.now();
        let Some(window) = self.ctx.calendar.business_window(&self.hours, now) else {
            debug!("closed today; empty diff");
            return Ok(Vec::new());
        };
        let (day_start, day_end) = self.ctx.calendar.day_bounds(window.date);
        let events = self
            .ctx
            .store
            .events_for_window(EventWindow {
                created_from: window.open - self.lookback,
                created_until: window.close,
                touching_from: day_start,
                touching_until: day_end,
            })
            .await?;
        Ok(fold_events(&self.ctx.calendar, &window, &events))
    }
}

/// Fold events (in creation order) into one bucket per business hour.
pub fn fold_events(
    calendar: &LocalCalendar,
    window: &BusinessWindow,
    events: &[LoggedEvent],
) -> Vec<HourlyDiff> {
    let mut buckets: BTreeMap<u32, HourlyDiff> = window
        .hours
        .iter()
        .map(|hour| (*hour, HourlyDiff::empty(*hour)))
        .collect();

    for logged in events {
        let event = &logged.event;
        let (removed_at, added_at) = match event.action {
            EventAction::Schedule | EventAction::RescheduleIncoming => (None, event.new_time),
            EventAction::Cancel | EventAction::RescheduleOutgoing => (event.old_time, None),
            EventAction::RescheduleSameDay => (event.old_time, event.new_time),
        };

        for (at, added) in [(removed_at, false), (added_at, true)] {
            let Some(at) = at else { continue };
            if calendar.date_of(&at) != window.date {
                continue;
            }
            let hour = calendar.local_hour(&at);
            match buckets.get_mut(&hour) {
                Some(bucket) if added => bucket.added.push(logged.subject()),
                Some(bucket) => bucket.removed.push(logged.subject()),
                None => warn!(
                    hour,
                    event_id = %event.id,
                    action = %event.action,
                    "event hour outside business hours; dropped from diff"
                ),
            }
        }
    }

    buckets.into_values().collect()
}

/// Today's appointment list.
#[derive(Clone)]
pub struct Schedule {
    ctx: SyncContext,
}

impl Schedule {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    pub async fn today(&self) -> Result<Vec<Appointment>, StoreError> {
        let (from, until) = self.ctx.calendar.today_bounds(self.ctx.clock.now());
        self.ctx.store.appointments_between(from, until).await
    }
}

/// One cron expression per open weekday, `lead_minutes` before opening. The scheduler's cron
/// syntax leads with a seconds field.
pub fn snapshot_cron_expressions(hours: &BusinessHours, lead_minutes: i64) -> Vec<String> {
    hours
        .iter()
        .filter(|(_, day)| !day.is_closed())
        .map(|(weekday, day)| {
            let (at, wrapped) = day
                .open
                .overflowing_sub_signed(Duration::minutes(lead_minutes));
            let weekday = if wrapped != 0 { weekday.pred() } else { weekday };
            format!(
                "0 {} {} * * {}",
                at.minute(),
                at.hour(),
                weekday.to_string().to_ascii_uppercase()
            )
        })
        .collect()
}

pub async fn build_snapshot_scheduler(
    reconciler: Arc<Reconciler>,
    hours: &BusinessHours,
    lead_minutes: i64,
    tz: Tz,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in snapshot_cron_expressions(hours, lead_minutes) {
        let reconciler = reconciler.clone();
        let job = Job::new_async_tz(cron.as_str(), tz, move |_uuid, _l| {
            let reconciler = reconciler.clone();
            Box::pin(async move {
                match reconciler.reconcile_snapshot().await {
                    Ok(summary) => info!(
                        snapshot_id = %summary.snapshot_id,
                        deleted = summary.deleted,
                        "scheduled snapshot finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled snapshot failed"),
                }
            })
        })
        .with_context(|| format!("creating snapshot job for cron {cron}"))?;
        sched.add(job).await.context("adding snapshot job")?;
    }
    Ok(sched)
}

pub async fn maybe_build_snapshot_scheduler(
    config: &AppConfig,
    reconciler: Arc<Reconciler>,
    hours: &BusinessHours,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_snapshot_scheduler(
        reconciler,
        hours,
        config.snapshot_lead_minutes,
        config.calendar.tz(),
    )
    .await
    .map(Some)
}
