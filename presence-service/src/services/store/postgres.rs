//! Postgres-backed [`StoreAdapter`] using `sqlx::PgPool`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use presence_types::domain::{Moment, MomentStatus, Session};
use presence_types::{MomentId, PresenceId, SessionId};
use secrecy::{ExposeSecret as _, SecretString};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::instrument;

use super::{NewPresence, NewSession, StoreAdapter, StoreError};

/// Postgres-backed implementation of [`StoreAdapter`].
pub struct PostgresStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct MomentRow {
    id: uuid::Uuid,
    slug: String,
    title: String,
    status: String,
    max_participants: i32,
    duration_seconds: i32,
    total_sessions: i64,
    total_minutes_present: i64,
    peak_presence: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<MomentRow> for Moment {
    type Error = StoreError;

    fn try_from(row: MomentRow) -> Result<Self, Self::Error> {
        let status = match row.status.as_str() {
            "scheduled" => MomentStatus::Scheduled,
            "live" => MomentStatus::Live,
            "ended" => MomentStatus::Ended,
            other => {
                return Err(StoreError::Unavailable(format!(
                    "unrecognized moment status in DB: {other}"
                )));
            }
        };
        Ok(Moment {
            id: MomentId::from_uuid(row.id),
            slug: row.slug,
            title: row.title,
            status,
            max_participants: row.max_participants as u32,
            duration_seconds: row.duration_seconds as u32,
            total_sessions: row.total_sessions as u64,
            total_minutes_present: row.total_minutes_present as u64,
            peak_presence: row.peak_presence as u32,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: uuid::Uuid,
    moment_id: uuid::Uuid,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: i64,
    user_agent: Option<String>,
    ip_hash: Option<String>,
    issued_token: Option<String>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: SessionId::from_uuid(row.id),
            moment_id: MomentId::from_uuid(row.moment_id),
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration_seconds: row.duration_seconds as u64,
            user_agent: row.user_agent,
            ip_hash: row.ip_hash,
            issued_token: row.issued_token,
        }
    }
}

fn unavailable(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |err| StoreError::Unavailable(format!("{context}: {err}"))
}

impl PostgresStore {
    /// Connects to Postgres, returning a pool sized from `max_connections`.
    #[instrument(level = "info", skip_all)]
    pub async fn connect(
        connection_string: &SecretString,
        max_connections: u32,
    ) -> eyre::Result<Self> {
        tracing::info!("connecting to postgres...");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string.expose_secret())
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl StoreAdapter for PostgresStore {
    #[instrument(level = "debug", skip(self))]
    async fn find_moment_by_id(&self, id: MomentId) -> Result<Option<Moment>, StoreError> {
        let row: Option<MomentRow> = sqlx::query_as(
            r#"
                SELECT id, slug, title, status, max_participants, duration_seconds,
                       total_sessions, total_minutes_present, peak_presence, created_at
                FROM moment
                WHERE id = $1
            "#,
        )
        .bind(id.into_inner())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("while loading moment by id"))?;
        row.map(Moment::try_from).transpose()
    }

    #[instrument(level = "debug", skip(self))]
    async fn find_first_live(&self) -> Result<Option<Moment>, StoreError> {
        let row: Option<MomentRow> = sqlx::query_as(
            r#"
                SELECT id, slug, title, status, max_participants, duration_seconds,
                       total_sessions, total_minutes_present, peak_presence, created_at
                FROM moment
                WHERE status = 'live'
                ORDER BY created_at
                LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("while loading live moment"))?;
        row.map(Moment::try_from).transpose()
    }

    #[instrument(level = "debug", skip(self))]
    async fn increment_total_sessions(&self, id: MomentId) -> Result<(), StoreError> {
        sqlx::query("UPDATE moment SET total_sessions = total_sessions + 1 WHERE id = $1")
            .bind(id.into_inner())
            .execute(&self.pool)
            .await
            .map_err(unavailable("while incrementing total_sessions"))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn bump_peak_presence(&self, id: MomentId, candidate: u32) -> Result<(), StoreError> {
        sqlx::query("UPDATE moment SET peak_presence = $2 WHERE id = $1 AND peak_presence < $2")
            .bind(id.into_inner())
            .bind(candidate as i32)
            .execute(&self.pool)
            .await
            .map_err(unavailable("while bumping peak_presence"))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, data))]
    async fn create_session(&self, data: NewSession) -> Result<SessionId, StoreError> {
        let id = SessionId::new();
        sqlx::query(
            r#"
                INSERT INTO session (id, moment_id, started_at, duration_seconds, user_agent, ip_hash)
                VALUES ($1, $2, now(), 0, $3, $4)
            "#,
        )
        .bind(id.into_inner())
        .bind(data.moment_id.into_inner())
        .bind(data.user_agent)
        .bind(data.ip_hash)
        .execute(&self.pool)
        .await
        .map_err(unavailable("while inserting session"))?;
        Ok(id)
    }

    #[instrument(level = "debug", skip(self))]
    async fn find_session(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
                SELECT id, moment_id, started_at, ended_at, duration_seconds, user_agent, ip_hash, issued_token
                FROM session
                WHERE id = $1
            "#,
        )
        .bind(id.into_inner())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("while loading session"))?;
        Ok(row.map(Session::from))
    }

    #[instrument(level = "debug", skip(self, token))]
    async fn set_issued_token(&self, id: SessionId, token: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE session SET issued_token = $2 WHERE id = $1")
            .bind(id.into_inner())
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(unavailable("while recording issued token"))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn end_session_transactionally(
        &self,
        session_id: SessionId,
        moment_id: MomentId,
        ended_at: DateTime<Utc>,
        duration_seconds: u64,
        minutes_present: u64,
    ) -> Result<(), StoreError> {
        let mut tx: Transaction<'_, Postgres> = self
            .pool
            .begin()
            .await
            .map_err(unavailable("while starting end-session transaction"))?;

        sqlx::query(
            "UPDATE session SET ended_at = $2, duration_seconds = $3 WHERE id = $1 AND ended_at IS NULL",
        )
        .bind(session_id.into_inner())
        .bind(ended_at)
        .bind(duration_seconds as i64)
        .execute(&mut *tx)
        .await
        .map_err(unavailable("while ending session"))?;

        sqlx::query("DELETE FROM presence WHERE session_id = $1")
            .bind(session_id.into_inner())
            .execute(&mut *tx)
            .await
            .map_err(unavailable("while deleting session's presences"))?;

        if minutes_present > 0 {
            sqlx::query(
                "UPDATE moment SET total_minutes_present = total_minutes_present + $2 WHERE id = $1",
            )
            .bind(moment_id.into_inner())
            .bind(minutes_present as i64)
            .execute(&mut *tx)
            .await
            .map_err(unavailable("while crediting minutes present"))?;
        }

        tx.commit()
            .await
            .map_err(unavailable("while committing end-session transaction"))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, data))]
    async fn create_presence(&self, data: NewPresence) -> Result<PresenceId, StoreError> {
        let id = PresenceId::new();
        sqlx::query(
            r#"
                INSERT INTO presence (id, socket_id, session_id, moment_id, connected_at, last_heartbeat_at)
                VALUES ($1, $2, $3, $4, now(), now())
            "#,
        )
        .bind(id.into_inner())
        .bind(&data.socket_id)
        .bind(data.session_id.into_inner())
        .bind(data.moment_id.into_inner())
        .execute(&self.pool)
        .await
        .map_err(unavailable("while inserting presence"))?;
        Ok(id)
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete_presence_by_socket_id(&self, socket_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM presence WHERE socket_id = $1")
            .bind(socket_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable("while deleting presence by socket id"))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete_presences_by_session_id(
        &self,
        session_id: SessionId,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM presence WHERE session_id = $1")
            .bind(session_id.into_inner())
            .execute(&self.pool)
            .await
            .map_err(unavailable("while deleting presences by session id"))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn update_presence_heartbeat(
        &self,
        socket_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE presence SET last_heartbeat_at = $2 WHERE socket_id = $1")
            .bind(socket_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(unavailable("while writing heartbeat"))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn count_presences(&self, moment_id: Option<MomentId>) -> Result<u64, StoreError> {
        let count: i64 = match moment_id {
            Some(moment_id) => {
                sqlx::query_scalar("SELECT count(*) FROM presence WHERE moment_id = $1")
                    .bind(moment_id.into_inner())
                    .fetch_one(&self.pool)
                    .await
            }
            None => {
                sqlx::query_scalar("SELECT count(*) FROM presence")
                    .fetch_one(&self.pool)
                    .await
            }
        }
        .map_err(unavailable("while counting presences"))?;
        Ok(count as u64)
    }

    #[instrument(level = "debug", skip(self))]
    async fn find_stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
                SELECT s.id, s.moment_id, s.started_at, s.ended_at, s.duration_seconds,
                       s.user_agent, s.ip_hash, s.issued_token
                FROM session s
                WHERE s.ended_at IS NULL
                  AND s.started_at < $1
                  AND NOT EXISTS (
                      SELECT 1 FROM presence p
                      WHERE p.session_id = s.id AND p.last_heartbeat_at >= $1
                  )
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("while finding stale sessions"))?;
        Ok(rows.into_iter().map(Session::from).collect())
    }

    #[instrument(level = "debug", skip(self))]
    async fn count_sessions(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM session")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable("while counting sessions"))?;
        Ok(count as u64)
    }

    #[instrument(level = "debug", skip(self))]
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable("while pinging store"))?;
        Ok(())
    }
}
