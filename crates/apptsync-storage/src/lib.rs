//! Durable appointment store, event log and snapshot audit storage for apptsync.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex as StdMutex;

use apptsync_core::{
    Appointment, Event, EventAction, LoggedEvent, NewEvent, ProviderAppointment, Snapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "apptsync-storage";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid stored data: {0}")]
    Invalid(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The single appointment-row change that accompanies one classified event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Create(Appointment),
    UpdateStart {
        appointment_id: Uuid,
        start_time: DateTime<Utc>,
    },
    MarkCanceled {
        appointment_id: Uuid,
    },
}

impl Mutation {
    pub fn target(&self) -> Uuid {
        match self {
            Mutation::Create(appt) => appt.id,
            Mutation::UpdateStart { appointment_id, .. } | Mutation::MarkCanceled { appointment_id } => {
                *appointment_id
            }
        }
    }
}

/// Everything one reconciliation run changes, applied as a unit.
#[derive(Debug, Clone)]
pub struct ReconcilePlan {
    pub present_provider_ids: HashSet<i64>,
    pub delete_from: DateTime<Utc>,
    pub delete_until: DateTime<Utc>,
    pub upserts: Vec<ProviderAppointment>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileCounts {
    pub deleted_provider_ids: Vec<i64>,
    pub created: usize,
    pub updated: usize,
}

impl ReconcileCounts {
    pub fn deleted(&self) -> usize {
        self.deleted_provider_ids.len()
    }
}

/// Event-log read window: events created in `[created_from, created_until)` whose old or new
/// time lies in `[touching_from, touching_until)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventWindow {
    pub created_from: DateTime<Utc>,
    pub created_until: DateTime<Utc>,
    pub touching_from: DateTime<Utc>,
    pub touching_until: DateTime<Utc>,
}

impl EventWindow {
    fn touches(&self, instant: Option<DateTime<Utc>>) -> bool {
        instant.is_some_and(|t| t >= self.touching_from && t < self.touching_until)
    }

    pub fn contains(&self, event: &Event) -> bool {
        event.created_at >= self.created_from
            && event.created_at < self.created_until
            && (self.touches(event.old_time) || self.touches(event.new_time))
    }
}

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn find_by_provider_id(&self, provider_id: i64) -> StoreResult<Option<Appointment>>;

    /// Apply one mutation and append its event atomically.
    async fn apply_transition(
        &self,
        mutation: Mutation,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<(Appointment, Event)>;

    /// Persist a listing capture in its own commit.
    async fn insert_snapshot(
        &self,
        payload: &JsonValue,
        captured_at: DateTime<Utc>,
    ) -> StoreResult<Snapshot>;

    /// Delete vendor-absent rows in the window and upsert every listed record atomically.
    async fn apply_reconciliation(&self, plan: ReconcilePlan) -> StoreResult<ReconcileCounts>;

    /// Events in creation order, joined with their appointment's subject name.
    async fn events_for_window(&self, window: EventWindow) -> StoreResult<Vec<LoggedEvent>>;

    async fn events_for_appointment(&self, appointment_id: Uuid) -> StoreResult<Vec<Event>>;

    /// Appointments starting in `[from, until)`, ordered by start time.
    async fn appointments_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<Appointment>>;

    async fn list_snapshots(&self, limit: usize) -> StoreResult<Vec<Snapshot>>;
}

pub fn snapshot_content_hash(payload: &JsonValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn build_snapshot(payload: &JsonValue, captured_at: DateTime<Utc>) -> Snapshot {
    let record_count = payload
        .as_array()
        .map(|records| records.len())
        .unwrap_or_default();
    Snapshot {
        id: Uuid::new_v4(),
        captured_at,
        payload: payload.clone(),
        content_hash: snapshot_content_hash(payload),
        record_count: i32::try_from(record_count).unwrap_or(i32::MAX),
    }
}

/// Write points at which [`MemoryStore`] can be told to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    EventAppend,
    Upsert,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    appointments: BTreeMap<Uuid, Appointment>,
    events: Vec<Event>,
    snapshots: Vec<Snapshot>,
}

impl MemoryState {
    fn by_provider_id(&self, provider_id: i64) -> Option<&Appointment> {
        self.appointments
            .values()
            .find(|appt| appt.provider_id == provider_id)
    }

    fn delete_appointment(&mut self, id: Uuid) {
        self.appointments.remove(&id);
        self.events.retain(|event| event.appointment_id != id);
    }
}

/// In-process store with the same all-or-nothing contract as [`PgStore`]: every write works on
/// a copy of the state that replaces the original only on success.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fault: StdMutex<Option<FaultPoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next write that reaches `point`, after earlier steps of the same unit ran.
    pub fn fail_next(&self, point: FaultPoint) {
        *self.fault.lock().unwrap_or_else(|e| e.into_inner()) = Some(point);
    }

    fn trip(&self, point: FaultPoint) -> StoreResult<()> {
        let mut fault = self.fault.lock().unwrap_or_else(|e| e.into_inner());
        if *fault == Some(point) {
            *fault = None;
            return Err(StoreError::Invalid(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    pub async fn insert_appointment(&self, appointment: Appointment) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.by_provider_id(appointment.provider_id).is_some() {
            return Err(StoreError::Conflict(format!(
                "provider id {} already stored",
                appointment.provider_id
            )));
        }
        state.appointments.insert(appointment.id, appointment);
        Ok(())
    }

    /// Append an event as-is, bypassing classification. Used to seed event logs.
    pub async fn insert_event(&self, event: Event) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.appointments.contains_key(&event.appointment_id) {
            return Err(StoreError::NotFound {
                entity: "appointment",
                id: event.appointment_id.to_string(),
            });
        }
        state.events.push(event);
        Ok(())
    }

    pub async fn appointments(&self) -> Vec<Appointment> {
        self.state.lock().await.appointments.values().cloned().collect()
    }

    pub async fn event_count(&self) -> usize {
        self.state.lock().await.events.len()
    }
}

#[async_trait]
impl AppointmentStore for MemoryStore {
    async fn find_by_provider_id(&self, provider_id: i64) -> StoreResult<Option<Appointment>> {
        Ok(self.state.lock().await.by_provider_id(provider_id).cloned())
    }

    async fn apply_transition(
        &self,
        mutation: Mutation,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<(Appointment, Event)> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();

        let appointment = match mutation {
            Mutation::Create(appt) => {
                if next.by_provider_id(appt.provider_id).is_some() {
                    return Err(StoreError::Conflict(format!(
                        "provider id {} already stored",
                        appt.provider_id
                    )));
                }
                next.appointments.insert(appt.id, appt.clone());
                appt
            }
            Mutation::UpdateStart {
                appointment_id,
                start_time,
            } => {
                let row = next
                    .appointments
                    .get_mut(&appointment_id)
                    .ok_or_else(|| StoreError::NotFound {
                        entity: "appointment",
                        id: appointment_id.to_string(),
                    })?;
                row.start_time = start_time;
                row.updated_at = now;
                row.clone()
            }
            Mutation::MarkCanceled { appointment_id } => {
                let row = next
                    .appointments
                    .get_mut(&appointment_id)
                    .ok_or_else(|| StoreError::NotFound {
                        entity: "appointment",
                        id: appointment_id.to_string(),
                    })?;
                row.is_canceled = Some(true);
                row.updated_at = now;
                row.clone()
            }
        };

        self.trip(FaultPoint::EventAppend)?;
        let event = event.into_event(Uuid::new_v4(), appointment.id, now);
        next.events.push(event.clone());

        *guard = next;
        Ok((appointment, event))
    }

    async fn insert_snapshot(
        &self,
        payload: &JsonValue,
        captured_at: DateTime<Utc>,
    ) -> StoreResult<Snapshot> {
        let snapshot = build_snapshot(payload, captured_at);
        self.state.lock().await.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn apply_reconciliation(&self, plan: ReconcilePlan) -> StoreResult<ReconcileCounts> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let mut counts = ReconcileCounts::default();

        let doomed: Vec<(Uuid, i64)> = next
            .appointments
            .values()
            .filter(|appt| {
                !plan.present_provider_ids.contains(&appt.provider_id)
                    && appt.start_time >= plan.delete_from
                    && appt.start_time < plan.delete_until
            })
            .map(|appt| (appt.id, appt.provider_id))
            .collect();
        for (id, provider_id) in doomed {
            next.delete_appointment(id);
            counts.deleted_provider_ids.push(provider_id);
        }

        for record in &plan.upserts {
            self.trip(FaultPoint::Upsert)?;
            let existing = next.by_provider_id(record.provider_id).map(|appt| appt.id);
            match existing.and_then(|id| next.appointments.get_mut(&id)) {
                Some(row) => {
                    row.start_time = record.start_utc();
                    row.is_canceled = Some(record.canceled);
                    row.updated_at = plan.now;
                    counts.updated += 1;
                }
                None => {
                    let appt = Appointment::from_provider(record, Uuid::new_v4(), plan.now);
                    next.appointments.insert(appt.id, appt);
                    counts.created += 1;
                }
            }
        }

        *guard = next;
        Ok(counts)
    }

    async fn events_for_window(&self, window: EventWindow) -> StoreResult<Vec<LoggedEvent>> {
        let state = self.state.lock().await;
        let mut out = Vec::new();
        for event in state.events.iter().filter(|event| window.contains(event)) {
            let Some(appt) = state.appointments.get(&event.appointment_id) else {
                continue;
            };
            out.push(LoggedEvent {
                event: event.clone(),
                first_name: appt.first_name.clone(),
                last_name: appt.last_name.clone(),
            });
        }
        // Stable: insertion order breaks created_at ties.
        out.sort_by_key(|logged| logged.event.created_at);
        Ok(out)
    }

    async fn events_for_appointment(&self, appointment_id: Uuid) -> StoreResult<Vec<Event>> {
        Ok(self
            .state
            .lock()
            .await
            .events
            .iter()
            .filter(|event| event.appointment_id == appointment_id)
            .cloned()
            .collect())
    }

    async fn appointments_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<Appointment>> {
        let state = self.state.lock().await;
        let mut out: Vec<Appointment> = state
            .appointments
            .values()
            .filter(|appt| appt.start_time >= from && appt.start_time < until)
            .cloned()
            .collect();
        out.sort_by_key(|appt| (appt.start_time, appt.provider_id));
        Ok(out)
    }

    async fn list_snapshots(&self, limit: usize) -> StoreResult<Vec<Snapshot>> {
        let state = self.state.lock().await;
        Ok(state.snapshots.iter().rev().take(limit).cloned().collect())
    }
}

/// Postgres-backed store. Every mutating operation runs in its own transaction; an uncommitted
/// transaction is rolled back when dropped.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

const APPOINTMENT_COLUMNS: &str = "id, provider_id, first_name, last_name, start_time, \
     duration_minutes, is_canceled, provider_created_at, provider_deleted_at, created_at, updated_at";

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

fn appointment_from_row(row: &PgRow) -> StoreResult<Appointment> {
    Ok(Appointment {
        id: row.try_get("id")?,
        provider_id: row.try_get("provider_id")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        start_time: row.try_get("start_time")?,
        duration_minutes: row.try_get("duration_minutes")?,
        is_canceled: row.try_get("is_canceled")?,
        provider_created_at: row.try_get("provider_created_at")?,
        provider_deleted_at: row.try_get("provider_deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_from_row(row: &PgRow) -> StoreResult<Event> {
    let action: String = row.try_get("action")?;
    let action: EventAction = action
        .parse()
        .map_err(|err: apptsync_core::CoreError| StoreError::Invalid(err.to_string()))?;
    Ok(Event {
        id: row.try_get("id")?,
        action,
        created_at: row.try_get("created_at")?,
        old_time: row.try_get("old_time")?,
        new_time: row.try_get("new_time")?,
        appointment_id: row.try_get("appointment_id")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> StoreResult<Snapshot> {
    Ok(Snapshot {
        id: row.try_get("id")?,
        captured_at: row.try_get("captured_at")?,
        payload: row.try_get("payload")?,
        content_hash: row.try_get("content_hash")?,
        record_count: row.try_get("record_count")?,
    })
}

fn map_unique_violation(err: sqlx::Error, context: impl FnOnce() -> String) -> StoreError {
    let unique = err
        .as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation());
    if unique {
        StoreError::Conflict(context())
    } else {
        StoreError::Database(err)
    }
}

#[async_trait]
impl AppointmentStore for PgStore {
    async fn find_by_provider_id(&self, provider_id: i64) -> StoreResult<Option<Appointment>> {
        let row = sqlx::query(&format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE provider_id = $1"
        ))
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(appointment_from_row).transpose()
    }

    async fn apply_transition(
        &self,
        mutation: Mutation,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<(Appointment, Event)> {
        let mut tx = self.pool.begin().await?;

        let row = match &mutation {
            Mutation::Create(appt) => sqlx::query(&format!(
                r#"
                INSERT INTO appointments ({APPOINTMENT_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                RETURNING {APPOINTMENT_COLUMNS}
                "#
            ))
            .bind(appt.id)
            .bind(appt.provider_id)
            .bind(&appt.first_name)
            .bind(&appt.last_name)
            .bind(appt.start_time)
            .bind(appt.duration_minutes)
            .bind(appt.is_canceled)
            .bind(appt.provider_created_at)
            .bind(appt.provider_deleted_at)
            .bind(appt.created_at)
            .bind(appt.updated_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|err| {
                map_unique_violation(err, || {
                    format!("provider id {} already stored", appt.provider_id)
                })
            })?,
            Mutation::UpdateStart {
                appointment_id,
                start_time,
            } => sqlx::query(&format!(
                r#"
                UPDATE appointments
                   SET start_time = $2,
                       updated_at = $3
                 WHERE id = $1
                RETURNING {APPOINTMENT_COLUMNS}
                "#
            ))
            .bind(appointment_id)
            .bind(start_time)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?,
            Mutation::MarkCanceled { appointment_id } => sqlx::query(&format!(
                r#"
                UPDATE appointments
                   SET is_canceled = TRUE,
                       updated_at = $2
                 WHERE id = $1
                RETURNING {APPOINTMENT_COLUMNS}
                "#
            ))
            .bind(appointment_id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?,
        };

        let Some(row) = row else {
            return Err(StoreError::NotFound {
                entity: "appointment",
                id: mutation.target().to_string(),
            });
        };
        let appointment = appointment_from_row(&row)?;

        let event = event.into_event(Uuid::new_v4(), appointment.id, now);
        sqlx::query(
            r#"
            INSERT INTO events (id, action, created_at, old_time, new_time, appointment_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.action.as_str())
        .bind(event.created_at)
        .bind(event.old_time)
        .bind(event.new_time)
        .bind(event.appointment_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((appointment, event))
    }

    async fn insert_snapshot(
        &self,
        payload: &JsonValue,
        captured_at: DateTime<Utc>,
    ) -> StoreResult<Snapshot> {
        let snapshot = build_snapshot(payload, captured_at);
        sqlx::query(
            r#"
            INSERT INTO snapshots (id, captured_at, payload, content_hash, record_count)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.captured_at)
        .bind(&snapshot.payload)
        .bind(&snapshot.content_hash)
        .bind(snapshot.record_count)
        .execute(&self.pool)
        .await?;
        Ok(snapshot)
    }

    async fn apply_reconciliation(&self, plan: ReconcilePlan) -> StoreResult<ReconcileCounts> {
        let span = info_span!("pg_reconcile", upserts = plan.upserts.len());
        async move {
            let mut tx = self.pool.begin().await?;
            let present: Vec<i64> = plan.present_provider_ids.iter().copied().collect();

            let deleted_rows = sqlx::query(
                r#"
                DELETE FROM appointments
                 WHERE NOT (provider_id = ANY($1))
                   AND start_time >= $2
                   AND start_time < $3
                RETURNING provider_id
                "#,
            )
            .bind(&present)
            .bind(plan.delete_from)
            .bind(plan.delete_until)
            .fetch_all(&mut *tx)
            .await?;

            let mut counts = ReconcileCounts::default();
            for row in &deleted_rows {
                counts.deleted_provider_ids.push(row.try_get("provider_id")?);
            }

            for record in &plan.upserts {
                let row = sqlx::query(&format!(
                    r#"
                    INSERT INTO appointments ({APPOINTMENT_COLUMNS})
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, $9, $9)
                    ON CONFLICT (provider_id) DO UPDATE
                       SET start_time = EXCLUDED.start_time,
                           is_canceled = EXCLUDED.is_canceled,
                           updated_at = EXCLUDED.updated_at
                    RETURNING (xmax = 0) AS inserted
                    "#
                ))
                .bind(Uuid::new_v4())
                .bind(record.provider_id)
                .bind(&record.first_name)
                .bind(&record.last_name)
                .bind(record.start_utc())
                .bind(record.duration_minutes)
                .bind(Some(record.canceled))
                .bind(record.created_at.with_timezone(&Utc))
                .bind(plan.now)
                .fetch_one(&mut *tx)
                .await?;
                if row.try_get::<bool, _>("inserted")? {
                    counts.created += 1;
                } else {
                    counts.updated += 1;
                }
            }

            tx.commit().await?;
            debug!(
                deleted = counts.deleted(),
                created = counts.created,
                updated = counts.updated,
                "reconciliation committed"
            );
            Ok(counts)
        }
        .instrument(span)
        .await
    }

    async fn events_for_window(&self, window: EventWindow) -> StoreResult<Vec<LoggedEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.action, e.created_at, e.old_time, e.new_time, e.appointment_id,
                   a.first_name, a.last_name
              FROM events e
              JOIN appointments a ON a.id = e.appointment_id
             WHERE e.created_at >= $1
               AND e.created_at < $2
               AND ((e.old_time >= $3 AND e.old_time < $4)
                 OR (e.new_time >= $3 AND e.new_time < $4))
             ORDER BY e.created_at, e.seq
            "#,
        )
        .bind(window.created_from)
        .bind(window.created_until)
        .bind(window.touching_from)
        .bind(window.touching_until)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(LoggedEvent {
                event: event_from_row(row)?,
                first_name: row.try_get("first_name")?,
                last_name: row.try_get("last_name")?,
            });
        }
        Ok(out)
    }

    async fn events_for_appointment(&self, appointment_id: Uuid) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT id, action, created_at, old_time, new_time, appointment_id
              FROM events
             WHERE appointment_id = $1
             ORDER BY created_at, seq
            "#,
        )
        .bind(appointment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn appointments_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<Appointment>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {APPOINTMENT_COLUMNS}
              FROM appointments
             WHERE start_time >= $1
               AND start_time < $2
             ORDER BY start_time, provider_id
            "#
        ))
        .bind(from)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(appointment_from_row).collect()
    }

    async fn list_snapshots(&self, limit: usize) -> StoreResult<Vec<Snapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT id, captured_at, payload, content_hash, record_count
              FROM snapshots
             ORDER BY captured_at DESC
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(snapshot_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apptsync_core::parse_provider_timestamp;
    use serde_json::json;

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_provider_timestamp(raw).unwrap().with_timezone(&Utc)
    }

    fn record(provider_id: i64, start: &str) -> ProviderAppointment {
        ProviderAppointment::from_json(&json!({
            "id": provider_id,
            "firstName": format!("First{provider_id}"),
            "lastName": format!("Last{provider_id}"),
            "datetime": start,
            "datetimeCreated": "2025-04-20T10:00:00-0600",
            "duration": "60",
        }))
        .unwrap()
    }

    fn appointment(provider_id: i64, start: &str) -> Appointment {
        Appointment::from_provider(
            &record(provider_id, start),
            Uuid::new_v4(),
            ts("2025-04-24T08:00:00-0600"),
        )
    }

    #[test]
    fn snapshot_hash_is_stable() {
        let payload = json!([{"id": 1}]);
        assert_eq!(snapshot_content_hash(&payload), snapshot_content_hash(&payload));
        assert_ne!(
            snapshot_content_hash(&payload),
            snapshot_content_hash(&json!([{"id": 2}]))
        );
        assert_eq!(build_snapshot(&payload, Utc::now()).record_count, 1);
    }

    #[tokio::test]
    async fn duplicate_create_is_a_conflict() {
        let store = MemoryStore::new();
        let now = ts("2025-04-24T09:00:00-0600");
        let first = appointment(7, "2025-04-24T17:00:00-0600");
        let event =
            NewEvent::for_action(EventAction::Schedule, None, Some(first.start_time)).unwrap();
        store
            .apply_transition(Mutation::Create(first), event.clone(), now)
            .await
            .expect("first create");

        let second = appointment(7, "2025-04-24T18:00:00-0600");
        let err = store
            .apply_transition(Mutation::Create(second), event, now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.appointments().await.len(), 1);
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn failed_event_append_rolls_back_the_mutation() {
        let store = MemoryStore::new();
        let appt = appointment(9, "2025-04-24T16:00:00-0600");
        let id = appt.id;
        store.insert_appointment(appt).await.unwrap();

        store.fail_next(FaultPoint::EventAppend);
        let event = NewEvent::for_action(
            EventAction::Cancel,
            Some(ts("2025-04-24T16:00:00-0600")),
            None,
        )
        .unwrap();
        let result = store
            .apply_transition(
                Mutation::MarkCanceled { appointment_id: id },
                event,
                ts("2025-04-24T10:00:00-0600"),
            )
            .await;

        assert!(result.is_err());
        let stored = store.find_by_provider_id(9).await.unwrap().unwrap();
        assert_eq!(stored.is_canceled, Some(false));
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn update_of_missing_row_is_not_found() {
        let store = MemoryStore::new();
        let event = NewEvent::for_action(
            EventAction::RescheduleSameDay,
            Some(ts("2025-04-24T16:00:00-0600")),
            Some(ts("2025-04-24T17:00:00-0600")),
        )
        .unwrap();
        let err = store
            .apply_transition(
                Mutation::UpdateStart {
                    appointment_id: Uuid::new_v4(),
                    start_time: ts("2025-04-24T17:00:00-0600"),
                },
                event,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn reconciliation_failure_keeps_prior_rows() {
        let store = MemoryStore::new();
        store
            .insert_appointment(appointment(1, "2025-04-24T16:00:00-0600"))
            .await
            .unwrap();

        store.fail_next(FaultPoint::Upsert);
        let plan = ReconcilePlan {
            present_provider_ids: HashSet::from([2]),
            delete_from: ts("2025-04-24T00:00:00-0600"),
            delete_until: ts("2025-04-25T00:00:00-0600"),
            upserts: vec![record(2, "2025-04-24T17:00:00-0600")],
            now: ts("2025-04-24T15:30:00-0600"),
        };
        assert!(store.apply_reconciliation(plan).await.is_err());

        let rows = store.appointments().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].provider_id, 1);
    }

    #[tokio::test]
    async fn deleting_an_appointment_cascades_to_its_events() {
        let store = MemoryStore::new();
        let appt = appointment(3, "2025-04-24T16:00:00-0600");
        let event =
            NewEvent::for_action(EventAction::Schedule, None, Some(appt.start_time)).unwrap();
        store
            .apply_transition(Mutation::Create(appt), event, ts("2025-04-24T09:00:00-0600"))
            .await
            .unwrap();
        assert_eq!(store.event_count().await, 1);

        let plan = ReconcilePlan {
            present_provider_ids: HashSet::new(),
            delete_from: ts("2025-04-24T00:00:00-0600"),
            delete_until: ts("2025-04-25T00:00:00-0600"),
            upserts: vec![],
            now: ts("2025-04-24T15:30:00-0600"),
        };
        let counts = store.apply_reconciliation(plan).await.unwrap();
        assert_eq!(counts.deleted_provider_ids, vec![3]);
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn event_window_filters_on_creation_and_touch_times() {
        let store = MemoryStore::new();
        let appt = appointment(4, "2025-04-24T17:00:00-0600");
        let appointment_id = appt.id;
        store.insert_appointment(appt).await.unwrap();

        let mk = |created: &str, old: Option<&str>, new: Option<&str>, action| Event {
            id: Uuid::new_v4(),
            action,
            created_at: ts(created),
            old_time: old.map(ts),
            new_time: new.map(ts),
            appointment_id,
        };
        store
            .insert_event(mk(
                "2025-04-24T15:45:00-0600",
                None,
                Some("2025-04-24T17:00:00-0600"),
                EventAction::Schedule,
            ))
            .await
            .unwrap();
        // Created before the look-back margin.
        store
            .insert_event(mk(
                "2025-04-24T09:00:00-0600",
                None,
                Some("2025-04-24T17:00:00-0600"),
                EventAction::Schedule,
            ))
            .await
            .unwrap();
        // Touches only tomorrow.
        store
            .insert_event(mk(
                "2025-04-24T16:10:00-0600",
                Some("2025-04-25T10:00:00-0600"),
                Some("2025-04-26T10:00:00-0600"),
                EventAction::RescheduleOutgoing,
            ))
            .await
            .unwrap();

        let window = EventWindow {
            created_from: ts("2025-04-24T15:30:00-0600"),
            created_until: ts("2025-04-24T20:00:00-0600"),
            touching_from: ts("2025-04-24T00:00:00-0600"),
            touching_until: ts("2025-04-25T00:00:00-0600"),
        };
        let events = store.events_for_window(window).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].first_name, "First4");
        assert_eq!(events[0].event.action, EventAction::Schedule);
    }

    async fn test_pg_store() -> Option<PgStore> {
        let url = std::env::var("APPTSYNC_TEST_DATABASE_URL").ok()?;
        let store = PgStore::connect(&url).await.ok()?;
        store.migrate().await.ok()?;
        Some(store)
    }

    #[tokio::test]
    async fn pg_transition_and_unique_provider_id() {
        let Some(store) = test_pg_store().await else {
            return;
        };
        let provider_id = i64::from(rand_suffix());
        let appt = appointment(provider_id, "2025-04-24T17:00:00-0600");
        let event =
            NewEvent::for_action(EventAction::Schedule, None, Some(appt.start_time)).unwrap();
        let (created, logged) = store
            .apply_transition(Mutation::Create(appt.clone()), event.clone(), Utc::now())
            .await
            .expect("create");
        assert_eq!(created.provider_id, provider_id);
        assert_eq!(logged.appointment_id, created.id);

        let dup = Appointment {
            id: Uuid::new_v4(),
            ..appt
        };
        let err = store
            .apply_transition(Mutation::Create(dup), event, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(
            store.events_for_appointment(created.id).await.unwrap().len(),
            1
        );
    }

    fn rand_suffix() -> u32 {
        Uuid::new_v4().as_u128() as u32 & 0x7fff_ffff
    }
}
