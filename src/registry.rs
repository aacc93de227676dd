use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: String,
    pub name: String,
    pub backend_host: String,
    pub backend_port: u16,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ModelRecord {
    pub fn backend_url(&self) -> String {
        format!("http://{}:{}", self.backend_host, self.backend_port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateModelInput {
    pub name: String,
    pub backend_host: String,
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    pub description: Option<String>,
}

fn default_backend_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub hostname: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_ok: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateServerInput {
    pub hostname: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    pub description: Option<String>,
}

#[derive(Clone)]
pub struct ModelStore {
    pool: Pool<Sqlite>,
}

impl ModelStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS models (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                backend_host TEXT NOT NULL,
                backend_port INTEGER NOT NULL DEFAULT 8000,
                enabled INTEGER NOT NULL DEFAULT 1,
                description TEXT,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_models_name ON models(name)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        // Backstop for the registration-time duplicate check: at most one
        // enabled row may own a name even under concurrent registrations.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_models_enabled_name
             ON models(name) WHERE enabled = 1",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS servers (
                id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL UNIQUE,
                port INTEGER NOT NULL DEFAULT 8000,
                description TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_checked_at TEXT,
                last_ok INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    /// Resolves a logical model name to its single enabled backend. Pure
    /// lookup; duplicate enabled names are rejected at registration so the
    /// first row is the only row.
    pub async fn resolve_backend(&self, name: &str) -> Result<Option<ModelRecord>, String> {
        let row = sqlx::query(&format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE name = ? AND enabled = 1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.map(|row| row_to_model(&row)).transpose()
    }

    pub async fn get_model(&self, id: &str) -> Result<Option<ModelRecord>, String> {
        let row = sqlx::query(&format!("SELECT {MODEL_COLUMNS} FROM models WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.map(|row| row_to_model(&row)).transpose()
    }

    pub async fn list_enabled_models(&self) -> Result<Vec<ModelRecord>, String> {
        let rows = sqlx::query(&format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE enabled = 1 ORDER BY name ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_model).collect()
    }

    pub async fn list_models(&self) -> Result<Vec<ModelRecord>, String> {
        let rows = sqlx::query(&format!(
            "SELECT {MODEL_COLUMNS} FROM models ORDER BY name ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_model).collect()
    }

    /// Registers a model. At most one enabled model may own a logical name;
    /// a second registration under an enabled name is rejected here rather
    /// than racing at resolution time.
    pub async fn create_model(&self, input: CreateModelInput) -> Result<ModelRecord, String> {
        if self.resolve_backend(&input.name).await?.is_some() {
            return Err(format!("model '{}' already registered", input.name));
        }
        let record = ModelRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name,
            backend_host: input.backend_host,
            backend_port: input.backend_port,
            enabled: true,
            description: input.description,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"INSERT INTO models (id, name, backend_host, backend_port, enabled, description, created_at)
               VALUES (?, ?, ?, ?, 1, ?, ?)"#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.backend_host)
        .bind(record.backend_port as i64)
        .bind(&record.description)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(record)
    }

    pub async fn delete_model(&self, id: &str) -> Result<Option<ModelRecord>, String> {
        let existing = self.get_model(id).await?;
        if existing.is_some() {
            sqlx::query("DELETE FROM models WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(existing)
    }

    pub async fn get_server_by_hostname(
        &self,
        hostname: &str,
    ) -> Result<Option<ServerRecord>, String> {
        let row = sqlx::query(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE hostname = ?"
        ))
        .bind(hostname)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.map(|row| row_to_server(&row)).transpose()
    }

    pub async fn list_enabled_servers(&self) -> Result<Vec<ServerRecord>, String> {
        let rows = sqlx::query(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE enabled = 1 ORDER BY hostname ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_server).collect()
    }

    pub async fn create_server(
        &self,
        input: CreateServerInput,
        last_ok: bool,
    ) -> Result<ServerRecord, String> {
        let record = ServerRecord {
            id: uuid::Uuid::new_v4().to_string(),
            hostname: input.hostname,
            port: input.port,
            description: input.description,
            enabled: true,
            last_checked_at: Some(Utc::now()),
            last_ok,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"INSERT INTO servers (id, hostname, port, description, enabled, last_checked_at, last_ok, created_at)
               VALUES (?, ?, ?, ?, 1, ?, ?, ?)"#,
        )
        .bind(&record.id)
        .bind(&record.hostname)
        .bind(record.port as i64)
        .bind(&record.description)
        .bind(record.last_checked_at.map(|t| t.to_rfc3339()))
        .bind(if record.last_ok { 1 } else { 0 })
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(record)
    }

    pub async fn delete_server(&self, id: &str) -> Result<bool, String> {
        let result = sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }
}

const MODEL_COLUMNS: &str =
    "id, name, backend_host, backend_port, enabled, description, created_at";
const SERVER_COLUMNS: &str =
    "id, hostname, port, description, enabled, last_checked_at, last_ok, created_at";

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

fn row_to_model(row: &sqlx::sqlite::SqliteRow) -> Result<ModelRecord, String> {
    Ok(ModelRecord {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        backend_host: row.try_get("backend_host").map_err(|e| e.to_string())?,
        backend_port: row
            .try_get::<i64, _>("backend_port")
            .map_err(|e| e.to_string())? as u16,
        enabled: row.try_get::<i32, _>("enabled").map_err(|e| e.to_string())? == 1,
        description: row.try_get("description").map_err(|e| e.to_string())?,
        created_at: parse_rfc3339(
            &row.try_get::<String, _>("created_at")
                .map_err(|e| e.to_string())?,
        )?,
    })
}

fn row_to_server(row: &sqlx::sqlite::SqliteRow) -> Result<ServerRecord, String> {
    let last_checked_at: Option<String> =
        row.try_get("last_checked_at").map_err(|e| e.to_string())?;
    Ok(ServerRecord {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        hostname: row.try_get("hostname").map_err(|e| e.to_string())?,
        port: row.try_get::<i64, _>("port").map_err(|e| e.to_string())? as u16,
        description: row.try_get("description").map_err(|e| e.to_string())?,
        enabled: row.try_get::<i32, _>("enabled").map_err(|e| e.to_string())? == 1,
        last_checked_at: last_checked_at.as_deref().map(parse_rfc3339).transpose()?,
        last_ok: row.try_get::<i32, _>("last_ok").map_err(|e| e.to_string())? == 1,
        created_at: parse_rfc3339(
            &row.try_get::<String, _>("created_at")
                .map_err(|e| e.to_string())?,
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> ModelStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        ModelStore::new(pool).await.unwrap()
    }

    fn model_input(name: &str, host: &str) -> CreateModelInput {
        CreateModelInput {
            name: name.to_string(),
            backend_host: host.to_string(),
            backend_port: 8000,
            description: None,
        }
    }

    #[tokio::test]
    async fn schema_rejects_a_second_enabled_row_per_name() {
        let store = test_store().await;
        store.create_model(model_input("m", "host-a")).await.unwrap();

        // Straight insert, skipping the registration-time lookup, so the
        // partial unique index is what rejects the duplicate.
        let err = sqlx::query(
            r#"INSERT INTO models (id, name, backend_host, backend_port, enabled, description, created_at)
               VALUES ('dup', 'm', 'host-b', 8000, 1, NULL, '2026-01-01T00:00:00Z')"#,
        )
        .execute(&store.pool)
        .await
        .unwrap_err();
        assert!(err.to_string().contains("UNIQUE"));

        // A disabled row under the same name is still allowed.
        sqlx::query(
            r#"INSERT INTO models (id, name, backend_host, backend_port, enabled, description, created_at)
               VALUES ('off', 'm', 'host-c', 8000, 0, NULL, '2026-01-01T00:00:00Z')"#,
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let resolved = store.resolve_backend("m").await.unwrap().unwrap();
        assert_eq!(resolved.backend_host, "host-a");
    }

    #[tokio::test]
    async fn name_is_reusable_after_delete() {
        let store = test_store().await;
        let first = store.create_model(model_input("m", "host-a")).await.unwrap();
        store.delete_model(&first.id).await.unwrap();
        let second = store.create_model(model_input("m", "host-b")).await.unwrap();
        assert_eq!(
            store.resolve_backend("m").await.unwrap().unwrap().id,
            second.id
        );
    }
}
