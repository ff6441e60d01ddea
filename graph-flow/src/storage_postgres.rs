use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

use crate::{
    Context,
    error::Result,
    signal::StopSignal,
    storage::{Session, SessionStorage},
};

const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS graph_flow_sessions (
    id TEXT PRIMARY KEY,
    graph_id TEXT NOT NULL,
    current_task_id TEXT NOT NULL,
    status_message TEXT,
    progress SMALLINT NOT NULL DEFAULT 0,
    context JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

/// PostgreSQL-backed SessionStorage. The context is stored as a JSONB column.
pub struct PostgresSessionStorage {
    pool: PgPool,
}

impl PostgresSessionStorage {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::query(CREATE_SESSIONS_TABLE).execute(&pool).await?;
        info!("PostgreSQL session storage ready");

        Ok(Self { pool })
    }
}

#[async_trait]
impl SessionStorage for PostgresSessionStorage {
    async fn save(&self, session: Session) -> Result<()> {
        let context = serde_json::to_value(&session.context)?;

        sqlx::query(
            "INSERT INTO graph_flow_sessions \
                 (id, graph_id, current_task_id, status_message, progress, context, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, NOW()) \
             ON CONFLICT (id) DO UPDATE SET \
                 graph_id = EXCLUDED.graph_id, \
                 current_task_id = EXCLUDED.current_task_id, \
                 status_message = EXCLUDED.status_message, \
                 progress = GREATEST(graph_flow_sessions.progress, EXCLUDED.progress), \
                 context = EXCLUDED.context, \
                 updated_at = NOW()",
        )
        .bind(&session.id)
        .bind(&session.graph_id)
        .bind(&session.current_task_id)
        .bind(&session.status_message)
        .bind(i16::from(session.progress))
        .bind(context)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, (String, String, String, Option<String>, i16, Value)>(
            "SELECT id, graph_id, current_task_id, status_message, progress, context \
             FROM graph_flow_sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, graph_id, current_task_id, status_message, progress, context)) = row else {
            return Ok(None);
        };

        Ok(Some(Session {
            id,
            graph_id,
            current_task_id,
            status_message,
            progress: progress.clamp(0, 100) as u8,
            context: serde_json::from_value::<Context>(context)?,
            stop_signal: StopSignal::new(),
        }))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM graph_flow_sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
