//! Group persistence.
//!
//! The engine never holds a lock across an evaluation. Instead every write of
//! the resolution fields is conditional on the state and token the evaluation
//! loaded, and the store reports which precondition failed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use super::group::{AlertGroup, EvaluationToken, Event, GroupId, ResolutionState, ResolvedBy};
use crate::error::{AutoResolveError, ErrorCode, Result};

/// Result of a conditional save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    /// Fields written.
    Success,
    /// The group no longer exists.
    NotFound,
    /// The stored state is no longer the expected one.
    StateMismatch {
        /// The state that was found.
        actual: ResolutionState,
    },
    /// A newer evaluation token was stamped since the group was loaded.
    TokenMismatch,
}

impl CasResult {
    /// Returns true if the write happened.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Result of stamping an evaluation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStamp {
    /// The token was written over `previous`.
    Stamped { previous: Option<EvaluationToken> },
    /// The group does not exist.
    NotFound,
}

impl TokenStamp {
    #[must_use]
    pub const fn is_stamped(&self) -> bool {
        matches!(self, Self::Stamped { .. })
    }
}

/// Storage for groups and their member events.
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Create an empty, open group. Fails with `GroupAlreadyExists` on a duplicate id.
    async fn create_group(&self, id: GroupId) -> Result<AlertGroup>;

    /// Fresh read of the group record.
    async fn load(&self, id: GroupId) -> Result<Option<AlertGroup>>;

    /// Number of member events (zero for a missing group).
    async fn size(&self, id: GroupId) -> Result<usize>;

    /// The most recently inserted event.
    async fn last_event(&self, id: GroupId) -> Result<Option<Event>>;

    /// Append an event with the next sequence number. Does not schedule.
    async fn append_event(&self, id: GroupId, payload: serde_json::Value) -> Result<Event>;

    /// Remove one event. Returns `false` if it was not stored.
    async fn remove_event(&self, id: GroupId, seq: u64) -> Result<bool>;

    /// Overwrite the active evaluation token, reporting the token it replaced.
    async fn stamp_token(&self, id: GroupId, token: EvaluationToken) -> Result<TokenStamp>;

    /// Put `previous` back if the active token is still `stamped`. Returns
    /// `false` when a newer stamp (or a deletion) got there first.
    async fn restore_token(
        &self,
        id: GroupId,
        stamped: EvaluationToken,
        previous: Option<EvaluationToken>,
    ) -> Result<bool>;

    /// Persist the resolution fields of `group` if the stored group still has
    /// `expected_state` and `expected_token`.
    async fn save(
        &self,
        group: &AlertGroup,
        expected_state: ResolutionState,
        expected_token: Option<EvaluationToken>,
    ) -> Result<CasResult>;

    /// Delete a group and its events. Returns `false` if it did not exist.
    async fn delete_group(&self, id: GroupId) -> Result<bool>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct GroupEntry {
    group: AlertGroup,
    events: Vec<Event>,
    next_seq: u64,
}

/// Store backed by a concurrent map. Each group is its own shard entry, so
/// writes to one group never wait on another.
#[derive(Debug, Default)]
pub struct InMemoryGroupStore {
    groups: DashMap<GroupId, GroupEntry>,
}

impl InMemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[async_trait]
impl GroupStore for InMemoryGroupStore {
    async fn create_group(&self, id: GroupId) -> Result<AlertGroup> {
        match self.groups.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(AutoResolveError::new(
                ErrorCode::GroupAlreadyExists,
                format!("Alert group already exists: {}", id),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let group = AlertGroup::new(id);
                slot.insert(GroupEntry {
                    group: group.clone(),
                    events: Vec::new(),
                    next_seq: 1,
                });
                Ok(group)
            }
        }
    }

    async fn load(&self, id: GroupId) -> Result<Option<AlertGroup>> {
        Ok(self.groups.get(&id).map(|entry| entry.group.clone()))
    }

    async fn size(&self, id: GroupId) -> Result<usize> {
        Ok(self.groups.get(&id).map_or(0, |entry| entry.events.len()))
    }

    async fn last_event(&self, id: GroupId) -> Result<Option<Event>> {
        Ok(self
            .groups
            .get(&id)
            .and_then(|entry| entry.events.last().cloned()))
    }

    async fn append_event(&self, id: GroupId, payload: serde_json::Value) -> Result<Event> {
        let mut entry = self
            .groups
            .get_mut(&id)
            .ok_or_else(|| AutoResolveError::group_not_found(id))?;

        let event = Event {
            seq: entry.next_seq,
            payload,
            received_at: Utc::now(),
        };
        entry.next_seq += 1;
        entry.events.push(event.clone());
        Ok(event)
    }

    async fn remove_event(&self, id: GroupId, seq: u64) -> Result<bool> {
        let Some(mut entry) = self.groups.get_mut(&id) else {
            return Ok(false);
        };
        let before = entry.events.len();
        entry.events.retain(|event| event.seq != seq);
        Ok(entry.events.len() < before)
    }

    async fn stamp_token(&self, id: GroupId, token: EvaluationToken) -> Result<TokenStamp> {
        match self.groups.get_mut(&id) {
            Some(mut entry) => {
                let previous = entry.group.active_evaluation_token.replace(token);
                Ok(TokenStamp::Stamped { previous })
            }
            None => Ok(TokenStamp::NotFound),
        }
    }

    async fn restore_token(
        &self,
        id: GroupId,
        stamped: EvaluationToken,
        previous: Option<EvaluationToken>,
    ) -> Result<bool> {
        match self.groups.get_mut(&id) {
            Some(mut entry) if entry.group.active_evaluation_token == Some(stamped) => {
                entry.group.active_evaluation_token = previous;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save(
        &self,
        group: &AlertGroup,
        expected_state: ResolutionState,
        expected_token: Option<EvaluationToken>,
    ) -> Result<CasResult> {
        let Some(mut entry) = self.groups.get_mut(&group.id) else {
            return Ok(CasResult::NotFound);
        };

        let stored = &mut entry.group;
        if stored.resolution_state != expected_state {
            return Ok(CasResult::StateMismatch {
                actual: stored.resolution_state,
            });
        }
        if stored.active_evaluation_token != expected_token {
            return Ok(CasResult::TokenMismatch);
        }

        stored.resolution_state = group.resolution_state;
        stored.resolved_at = group.resolved_at;
        stored.resolved_by = group.resolved_by;
        stored.suspended_at = group.suspended_at;
        Ok(CasResult::Success)
    }

    async fn delete_group(&self, id: GroupId) -> Result<bool> {
        Ok(self.groups.remove(&id).is_some())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PostgreSQL store
// ═══════════════════════════════════════════════════════════════════════════════

/// Store backed by PostgreSQL (`alert_groups` and `alert_group_events`).
#[derive(Clone)]
pub struct PgGroupStore {
    pool: PgPool,
}

impl PgGroupStore {
    /// Create a new connection pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AutoResolveError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_group(row: &sqlx::postgres::PgRow) -> Result<AlertGroup> {
        let state: String = row.try_get("resolution_state")?;
        let resolved_by: Option<String> = row.try_get("resolved_by")?;

        Ok(AlertGroup {
            id: GroupId(row.try_get("id")?),
            resolution_state: state.parse()?,
            active_evaluation_token: row
                .try_get::<Option<Uuid>, _>("active_evaluation_token")?
                .map(EvaluationToken),
            resolved_at: row.try_get("resolved_at")?,
            resolved_by: resolved_by.map(|s| s.parse::<ResolvedBy>()).transpose()?,
            suspended_at: row.try_get("suspended_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl GroupStore for PgGroupStore {
    async fn create_group(&self, id: GroupId) -> Result<AlertGroup> {
        let group = AlertGroup::new(id);
        let inserted = sqlx::query(
            r#"
            INSERT INTO alert_groups (id, resolution_state, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id.0)
        .bind(group.resolution_state.as_str())
        .bind(group.created_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(AutoResolveError::new(
                ErrorCode::GroupAlreadyExists,
                format!("Alert group already exists: {}", id),
            ));
        }
        Ok(group)
    }

    async fn load(&self, id: GroupId) -> Result<Option<AlertGroup>> {
        let row = sqlx::query(
            r#"
            SELECT id, resolution_state, active_evaluation_token,
                   resolved_at, resolved_by, suspended_at, created_at
            FROM alert_groups
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_group).transpose()
    }

    async fn size(&self, id: GroupId) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM alert_group_events WHERE group_id = $1")
                .bind(id.0)
                .fetch_one(&self.pool)
                .await?;

        Ok(count.max(0) as usize)
    }

    async fn last_event(&self, id: GroupId) -> Result<Option<Event>> {
        let row = sqlx::query(
            r#"
            SELECT seq, payload, received_at
            FROM alert_group_events
            WHERE group_id = $1
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<Event> {
            Ok(Event {
                seq: row.try_get::<i64, _>("seq")? as u64,
                payload: row.try_get("payload")?,
                received_at: row.try_get("received_at")?,
            })
        })
        .transpose()
    }

    async fn append_event(&self, id: GroupId, payload: serde_json::Value) -> Result<Event> {
        let mut tx = self.pool.begin().await?;

        let seq: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE alert_groups
            SET next_event_seq = next_event_seq + 1
            WHERE id = $1
            RETURNING next_event_seq
            "#,
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let seq = seq.ok_or_else(|| AutoResolveError::group_not_found(id))?;
        let received_at: DateTime<Utc> = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO alert_group_events (group_id, seq, payload, received_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id.0)
        .bind(seq)
        .bind(&payload)
        .bind(received_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Event {
            seq: seq as u64,
            payload,
            received_at,
        })
    }

    async fn remove_event(&self, id: GroupId, seq: u64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM alert_group_events WHERE group_id = $1 AND seq = $2")
            .bind(id.0)
            .bind(seq as i64)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn stamp_token(&self, id: GroupId, token: EvaluationToken) -> Result<TokenStamp> {
        let row = sqlx::query(
            r#"
            UPDATE alert_groups AS g
            SET active_evaluation_token = $2
            FROM (
                SELECT id, active_evaluation_token AS previous
                FROM alert_groups
                WHERE id = $1
                FOR UPDATE
            ) AS old
            WHERE g.id = old.id
            RETURNING old.previous
            "#,
        )
        .bind(id.0)
        .bind(token.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(TokenStamp::Stamped {
                previous: row
                    .try_get::<Option<Uuid>, _>("previous")?
                    .map(EvaluationToken),
            }),
            None => Ok(TokenStamp::NotFound),
        }
    }

    async fn restore_token(
        &self,
        id: GroupId,
        stamped: EvaluationToken,
        previous: Option<EvaluationToken>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE alert_groups
            SET active_evaluation_token = $3
            WHERE id = $1 AND active_evaluation_token = $2
            "#,
        )
        .bind(id.0)
        .bind(stamped.0)
        .bind(previous.map(|t| t.0))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn save(
        &self,
        group: &AlertGroup,
        expected_state: ResolutionState,
        expected_token: Option<EvaluationToken>,
    ) -> Result<CasResult> {
        let result = sqlx::query(
            r#"
            UPDATE alert_groups
            SET resolution_state = $2, resolved_at = $3, resolved_by = $4, suspended_at = $5
            WHERE id = $1
              AND resolution_state = $6
              AND active_evaluation_token IS NOT DISTINCT FROM $7
            "#,
        )
        .bind(group.id.0)
        .bind(group.resolution_state.as_str())
        .bind(group.resolved_at)
        .bind(group.resolved_by.map(|by| by.as_str()))
        .bind(group.suspended_at)
        .bind(expected_state.as_str())
        .bind(expected_token.map(|t| t.0))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(CasResult::Success);
        }

        // Work out which precondition failed.
        match self.load(group.id).await? {
            None => Ok(CasResult::NotFound),
            Some(current) if current.resolution_state != expected_state => {
                Ok(CasResult::StateMismatch {
                    actual: current.resolution_state,
                })
            }
            Some(_) => Ok(CasResult::TokenMismatch),
        }
    }

    async fn delete_group(&self, id: GroupId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM alert_groups WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_and_load() {
        let store = InMemoryGroupStore::new();
        let id = GroupId::new();
        store.create_group(id).await.unwrap();

        let group = store.load(id).await.unwrap().unwrap();
        assert_eq!(group.resolution_state, ResolutionState::Open);
        assert!(group.active_evaluation_token.is_none());

        let err = store.create_group(id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::GroupAlreadyExists);
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_seq() {
        let store = InMemoryGroupStore::new();
        let id = GroupId::new();
        store.create_group(id).await.unwrap();

        for i in 0..3 {
            store.append_event(id, json!({ "n": i })).await.unwrap();
        }

        assert_eq!(store.size(id).await.unwrap(), 3);
        let last = store.last_event(id).await.unwrap().unwrap();
        assert_eq!(last.seq, 3);
        assert_eq!(last.payload, json!({ "n": 2 }));
    }

    #[tokio::test]
    async fn test_append_to_missing_group_fails() {
        let store = InMemoryGroupStore::new();
        let err = store
            .append_event(GroupId::new(), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::GroupNotFound);
    }

    #[tokio::test]
    async fn test_save_checks_state_and_token() {
        let store = InMemoryGroupStore::new();
        let id = GroupId::new();
        store.create_group(id).await.unwrap();

        let token = EvaluationToken::new();
        assert!(store.stamp_token(id, token).await.unwrap().is_stamped());
        let loaded = store.load(id).await.unwrap().unwrap();

        // A newer schedule lands between load and save.
        store.stamp_token(id, EvaluationToken::new()).await.unwrap();

        let mut resolved = loaded.clone();
        resolved.resolve_by_source().unwrap();
        let result = store
            .save(&resolved, ResolutionState::Open, Some(token))
            .await
            .unwrap();
        assert_eq!(result, CasResult::TokenMismatch);
        assert_eq!(
            store.load(id).await.unwrap().unwrap().resolution_state,
            ResolutionState::Open
        );
    }

    #[tokio::test]
    async fn test_save_reports_state_mismatch_and_not_found() {
        let store = InMemoryGroupStore::new();
        let id = GroupId::new();
        let mut group = store.create_group(id).await.unwrap();
        group.suspend_auto_resolve().unwrap();

        assert!(store
            .save(&group, ResolutionState::Open, None)
            .await
            .unwrap()
            .is_success());

        let result = store
            .save(&group, ResolutionState::Open, None)
            .await
            .unwrap();
        assert_eq!(
            result,
            CasResult::StateMismatch {
                actual: ResolutionState::AutoResolveSuspended
            }
        );

        assert!(store.delete_group(id).await.unwrap());
        assert_eq!(
            store.save(&group, ResolutionState::Open, None).await.unwrap(),
            CasResult::NotFound
        );
        assert_eq!(
            store.stamp_token(id, EvaluationToken::new()).await.unwrap(),
            TokenStamp::NotFound
        );
    }

    #[tokio::test]
    async fn test_stamp_token_leaves_state_alone() {
        let store = InMemoryGroupStore::new();
        let id = GroupId::new();
        let mut group = store.create_group(id).await.unwrap();
        group.resolve_by_source().unwrap();
        store
            .save(&group, ResolutionState::Open, None)
            .await
            .unwrap();

        let token = EvaluationToken::new();
        store.stamp_token(id, token).await.unwrap();

        let loaded = store.load(id).await.unwrap().unwrap();
        assert_eq!(loaded.resolution_state, ResolutionState::Resolved);
        assert_eq!(loaded.active_evaluation_token, Some(token));
    }

    #[tokio::test]
    async fn test_stamp_reports_previous_and_restore_is_conditional() {
        let store = InMemoryGroupStore::new();
        let id = GroupId::new();
        store.create_group(id).await.unwrap();

        let first = EvaluationToken::new();
        assert_eq!(
            store.stamp_token(id, first).await.unwrap(),
            TokenStamp::Stamped { previous: None }
        );
        let second = EvaluationToken::new();
        assert_eq!(
            store.stamp_token(id, second).await.unwrap(),
            TokenStamp::Stamped { previous: Some(first) }
        );

        // Only the stamp being rolled back may be replaced.
        assert!(!store.restore_token(id, first, None).await.unwrap());
        assert!(store.restore_token(id, second, Some(first)).await.unwrap());
        assert_eq!(
            store.load(id).await.unwrap().unwrap().active_evaluation_token,
            Some(first)
        );
        assert!(!store.restore_token(GroupId::new(), first, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_event() {
        let store = InMemoryGroupStore::new();
        let id = GroupId::new();
        store.create_group(id).await.unwrap();
        store.append_event(id, json!({ "n": 1 })).await.unwrap();
        let second = store.append_event(id, json!({ "n": 2 })).await.unwrap();

        assert!(store.remove_event(id, second.seq).await.unwrap());
        assert!(!store.remove_event(id, second.seq).await.unwrap());
        assert_eq!(store.size(id).await.unwrap(), 1);
        assert_eq!(store.last_event(id).await.unwrap().unwrap().payload, json!({ "n": 1 }));

        // Sequence numbers are never reused.
        let third = store.append_event(id, json!({ "n": 3 })).await.unwrap();
        assert_eq!(third.seq, 3);
    }
}
