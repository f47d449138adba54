//! Durable instance/template/metrics store on SQLite.
//!
//! All access goes through parameterized statements; timestamps are RFC3339
//! text, instance config is a JSON object column. Deleting an instance
//! cascades to its metric samples via the foreign key.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use wahub_common::{HubError, Instance, InstanceStatus, MetricSample, Result, Template};

#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    pub async fn connect(db_path: &Path) -> Result<Self> {
        let mut options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(3));

        options = options.pragma("temp_store", "MEMORY");
        options = options.pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            HubError::Config(format!("failed to run registry migrations: {e}"))
        })?;

        debug!("registry ready: {}", db_path.display());
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // --- Instances ---

    pub async fn insert_instance(&self, instance: &Instance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instances (
                id, owner_id, name, description, assigned_port, backend_handle,
                status, config, created_at, updated_at, last_started_at, last_stopped_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(instance.id.to_string())
        .bind(instance.owner_id.to_string())
        .bind(&instance.name)
        .bind(&instance.description)
        .bind(instance.assigned_port.map(i64::from))
        .bind(&instance.backend_handle)
        .bind(instance.status.as_str())
        .bind(serde_json::to_string(&instance.config)?)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(instance.last_started_at)
        .bind(instance.last_stopped_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persists every mutable field of an existing row.
    pub async fn update_instance(&self, instance: &Instance) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE instances SET
                description = ?2,
                assigned_port = ?3,
                backend_handle = ?4,
                status = ?5,
                config = ?6,
                updated_at = ?7,
                last_started_at = ?8,
                last_stopped_at = ?9
            WHERE id = ?1
            "#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.description)
        .bind(instance.assigned_port.map(i64::from))
        .bind(&instance.backend_handle)
        .bind(instance.status.as_str())
        .bind(serde_json::to_string(&instance.config)?)
        .bind(instance.updated_at)
        .bind(instance.last_started_at)
        .bind(instance.last_stopped_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HubError::NotFound(format!("instance {}", instance.id)));
        }
        Ok(())
    }

    pub async fn find_instance(&self, id: Uuid) -> Result<Option<Instance>> {
        let row = sqlx::query("SELECT * FROM instances WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(instance_from_row).transpose()
    }

    pub async fn get_instance(&self, id: Uuid) -> Result<Instance> {
        self.find_instance(id)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("instance {id}")))
    }

    pub async fn find_by_name(&self, owner_id: Uuid, name: &str) -> Result<Option<Instance>> {
        let row = sqlx::query("SELECT * FROM instances WHERE owner_id = ?1 AND name = ?2")
            .bind(owner_id.to_string())
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(instance_from_row).transpose()
    }

    pub async fn find_by_port(&self, port: u16) -> Result<Option<Instance>> {
        let row = sqlx::query("SELECT * FROM instances WHERE assigned_port = ?1")
            .bind(i64::from(port))
            .fetch_optional(&self.pool)
            .await?;
        row.map(instance_from_row).transpose()
    }

    /// All instances, or one owner's, newest first.
    pub async fn list_instances(&self, owner_id: Option<Uuid>) -> Result<Vec<Instance>> {
        let rows = match owner_id {
            Some(owner) => {
                sqlx::query(
                    "SELECT * FROM instances WHERE owner_id = ?1 ORDER BY created_at DESC",
                )
                .bind(owner.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM instances ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(instance_from_row).collect()
    }

    /// Running instances that have a backend handle, i.e. the metrics
    /// collector's working set.
    pub async fn list_running(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query(
            "SELECT * FROM instances WHERE status = 'running' AND backend_handle IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(instance_from_row).collect()
    }

    pub async fn delete_instance(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM instances WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Templates ---

    pub async fn insert_template(&self, template: &Template) -> Result<()> {
        if template.is_default {
            // At most one global default.
            sqlx::query("UPDATE templates SET is_default = 0 WHERE owner_id IS NULL")
                .execute(&self.pool)
                .await?;
        }
        sqlx::query(
            r#"
            INSERT INTO templates (id, name, owner_id, config, is_default, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(template.id.to_string())
        .bind(&template.name)
        .bind(template.owner_id.map(|o| o.to_string()))
        .bind(serde_json::to_string(&template.config)?)
        .bind(template.is_default)
        .bind(template.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_template(&self, id: Uuid) -> Result<Option<Template>> {
        let row = sqlx::query("SELECT * FROM templates WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(template_from_row).transpose()
    }

    pub async fn default_template(&self) -> Result<Option<Template>> {
        let row = sqlx::query(
            "SELECT * FROM templates WHERE is_default = 1 AND owner_id IS NULL LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(template_from_row).transpose()
    }

    // --- Metric samples ---

    pub async fn insert_metric_sample(&self, sample: &MetricSample) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metric_samples (
                instance_id, cpu_percent, mem_used_bytes, mem_limit_bytes,
                net_rx_bytes, net_tx_bytes, estimated, sampled_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(sample.instance_id.to_string())
        .bind(sample.cpu_percent)
        .bind(sample.mem_used_bytes)
        .bind(sample.mem_limit_bytes)
        .bind(sample.net_rx_bytes)
        .bind(sample.net_tx_bytes)
        .bind(sample.estimated)
        .bind(sample.sampled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn samples_for(&self, instance_id: Uuid, limit: i64) -> Result<Vec<MetricSample>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM metric_samples
            WHERE instance_id = ?1
            ORDER BY sampled_at DESC
            LIMIT ?2
            "#,
        )
        .bind(instance_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(sample_from_row).collect()
    }

    /// Deletes samples older than the cutoff; returns how many went away.
    pub async fn prune_samples_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM metric_samples WHERE sampled_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // --- Allocator counter ---

    pub async fn load_port_counter(&self) -> Result<Option<u16>> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT next_port FROM allocator_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.map(|v| v as u16))
    }

    pub async fn store_port_counter(&self, port: u16) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO allocator_state (id, next_port) VALUES (1, ?1)
            ON CONFLICT(id) DO UPDATE SET next_port = excluded.next_port
            "#,
        )
        .bind(i64::from(port))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_uuid(value: String) -> Result<Uuid> {
    Uuid::parse_str(&value)
        .map_err(|e| HubError::Validation(format!("corrupt uuid in registry: {e}")))
}

fn parse_config(value: String) -> Result<HashMap<String, String>> {
    Ok(serde_json::from_str(&value)?)
}

fn instance_from_row(row: SqliteRow) -> Result<Instance> {
    let status: String = row.try_get("status")?;
    Ok(Instance {
        id: parse_uuid(row.try_get("id")?)?,
        owner_id: parse_uuid(row.try_get("owner_id")?)?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        assigned_port: row
            .try_get::<Option<i64>, _>("assigned_port")?
            .map(|p| p as u16),
        backend_handle: row.try_get("backend_handle")?,
        status: status.parse::<InstanceStatus>()?,
        config: parse_config(row.try_get("config")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_started_at: row.try_get("last_started_at")?,
        last_stopped_at: row.try_get("last_stopped_at")?,
    })
}

fn template_from_row(row: SqliteRow) -> Result<Template> {
    Ok(Template {
        id: parse_uuid(row.try_get("id")?)?,
        name: row.try_get("name")?,
        owner_id: row
            .try_get::<Option<String>, _>("owner_id")?
            .map(parse_uuid)
            .transpose()?,
        config: parse_config(row.try_get("config")?)?,
        is_default: row.try_get("is_default")?,
        created_at: row.try_get("created_at")?,
    })
}

fn sample_from_row(row: SqliteRow) -> Result<MetricSample> {
    Ok(MetricSample {
        instance_id: parse_uuid(row.try_get("instance_id")?)?,
        cpu_percent: row.try_get("cpu_percent")?,
        mem_used_bytes: row.try_get("mem_used_bytes")?,
        mem_limit_bytes: row.try_get("mem_limit_bytes")?,
        net_rx_bytes: row.try_get("net_rx_bytes")?,
        net_tx_bytes: row.try_get("net_tx_bytes")?,
        estimated: row.try_get("estimated")?,
        sampled_at: row.try_get("sampled_at")?,
    })
}
