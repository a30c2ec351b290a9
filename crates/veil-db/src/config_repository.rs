use std::collections::BTreeMap;

use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use veil_core::error::AppError;
use veil_core::models::{JsonObject, ParserConfig};

/// Repository for per-(workspace, source) parser configuration.
#[derive(Clone)]
pub struct ParserConfigRepository {
    pool: Pool<Postgres>,
}

impl ParserConfigRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The configuration of `source` in `workspace`, if one is stored.
    pub async fn get(
        &self,
        workspace: &str,
        source: &str,
    ) -> Result<Option<ParserConfig>, AppError> {
        let row = sqlx::query_as::<_, ParserConfigRow>(
            r#"
            SELECT workspace_id, source_name, parser_name, options, user_agents, cookies, use_render,
                   is_active
            FROM workspace_parser_configs
            WHERE workspace_id = $1 AND source_name = $2
            "#,
        )
        .bind(workspace)
        .bind(source)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    /// Insert or replace the configuration for its (workspace, source) pair.
    pub async fn upsert(&self, config: &ParserConfig) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO workspace_parser_configs
                (workspace_id, source_name, parser_name, options, user_agents, cookies, use_render,
                 is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (workspace_id, source_name) DO UPDATE SET
                parser_name = EXCLUDED.parser_name,
                options = EXCLUDED.options,
                user_agents = EXCLUDED.user_agents,
                cookies = EXCLUDED.cookies,
                use_render = EXCLUDED.use_render,
                is_active = EXCLUDED.is_active,
                updated_at = NOW()
            "#,
        )
        .bind(&config.workspace_id)
        .bind(&config.source_name)
        .bind(&config.parser_name)
        .bind(Json(&config.options))
        .bind(Json(&config.user_agents))
        .bind(Json(&config.cookies))
        .bind(config.use_render)
        .bind(config.is_active)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::debug!(
            workspace = %config.workspace_id,
            source = %config.source_name,
            parser = %config.parser_name,
            "Parser configuration saved"
        );
        Ok(())
    }

    /// Pause or resume a source without touching the rest of its
    /// configuration. Returns `true` if the configuration exists.
    pub async fn set_active(&self, workspace: &str, source: &str, active: bool) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE workspace_parser_configs
            SET is_active = $3, updated_at = NOW()
            WHERE workspace_id = $1 AND source_name = $2
            "#,
        )
        .bind(workspace)
        .bind(source)
        .bind(active)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a configuration. Returns `true` if one existed.
    pub async fn delete(&self, workspace: &str, source: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM workspace_parser_configs WHERE workspace_id = $1 AND source_name = $2",
        )
        .bind(workspace)
        .bind(source)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// All configurations of a workspace, ordered by source name.
    pub async fn list(&self, workspace: &str) -> Result<Vec<ParserConfig>, AppError> {
        let rows = sqlx::query_as::<_, ParserConfigRow>(
            r#"
            SELECT workspace_id, source_name, parser_name, options, user_agents, cookies, use_render,
                   is_active
            FROM workspace_parser_configs
            WHERE workspace_id = $1
            ORDER BY source_name
            "#,
        )
        .bind(workspace)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ParserConfigRow {
    workspace_id: String,
    source_name: String,
    parser_name: String,
    options: Json<JsonObject>,
    user_agents: Json<Vec<String>>,
    cookies: Json<BTreeMap<String, String>>,
    use_render: bool,
    is_active: bool,
}

impl From<ParserConfigRow> for ParserConfig {
    fn from(row: ParserConfigRow) -> Self {
        ParserConfig {
            workspace_id: row.workspace_id,
            source_name: row.source_name,
            parser_name: row.parser_name,
            options: row.options.0,
            user_agents: row.user_agents.0,
            cookies: row.cookies.0,
            use_render: row.use_render,
            is_active: row.is_active,
        }
    }
}

// -- Trait implementation --

impl veil_core::traits::ConfigStore for ParserConfigRepository {
    async fn load_config(
        &self,
        workspace: &str,
        source: &str,
    ) -> Result<Option<ParserConfig>, AppError> {
        self.get(workspace, source).await
    }
}
