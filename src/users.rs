use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    /// The opaque secret. Generated once at creation, never rotated in place.
    pub key: String,
    pub name: String,
    pub enabled: bool,
    pub max_tokens_per_day: i64,
    pub max_tokens_per_month: i64,
    pub rate_limit_per_minute: i64,
    pub max_concurrent_sessions: i64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn masked_key(&self) -> String {
        if self.key.len() > 15 {
            format!("{}...", &self.key[..15])
        } else {
            self.key.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateApiKeyInput {
    pub user_id: String,
    pub name: String,
    #[serde(default = "default_tokens_per_day")]
    pub max_tokens_per_day: i64,
    #[serde(default = "default_tokens_per_month")]
    pub max_tokens_per_month: i64,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i64,
    #[serde(default = "default_max_sessions")]
    pub max_concurrent_sessions: i64,
}

fn default_tokens_per_day() -> i64 {
    100_000
}

fn default_tokens_per_month() -> i64 {
    1_000_000
}

fn default_rate_limit() -> i64 {
    100
}

fn default_max_sessions() -> i64 {
    5
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateApiKeyInput {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub max_tokens_per_day: Option<i64>,
    pub max_tokens_per_month: Option<i64>,
    pub rate_limit_per_minute: Option<i64>,
    pub max_concurrent_sessions: Option<i64>,
}

#[derive(Clone)]
pub struct UserStore {
    pool: Pool<Sqlite>,
}

impl UserStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                email TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                key TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                max_tokens_per_day INTEGER NOT NULL DEFAULT 100000,
                max_tokens_per_month INTEGER NOT NULL DEFAULT 1000000,
                rate_limit_per_minute INTEGER NOT NULL DEFAULT 100,
                max_concurrent_sessions INTEGER NOT NULL DEFAULT 5,
                created_at TEXT NOT NULL,
                last_used_at TEXT
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_api_keys_key ON api_keys(key)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn create_user(&self, username: &str, email: Option<&str>) -> Result<User, String> {
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.map(|s| s.to_string()),
            enabled: true,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO users (id, username, email, enabled, created_at) VALUES (?, ?, ?, 1, ?)",
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(user)
    }

    pub async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, String> {
        let row = sqlx::query(
            "SELECT id, username, email, enabled, created_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.map(|row| row_to_user(&row)).transpose()
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, String> {
        let row = sqlx::query(
            "SELECT id, username, email, enabled, created_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.map(|row| row_to_user(&row)).transpose()
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, String> {
        let row = sqlx::query(
            "SELECT id, username, email, enabled, created_at FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.map(|row| row_to_user(&row)).transpose()
    }

    pub async fn list_users(&self) -> Result<Vec<User>, String> {
        let rows = sqlx::query(
            "SELECT id, username, email, enabled, created_at FROM users ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_user).collect()
    }

    pub async fn update_user(
        &self,
        id: &str,
        enabled: Option<bool>,
        email: Option<Option<String>>,
    ) -> Result<Option<User>, String> {
        if let Some(enabled) = enabled {
            sqlx::query("UPDATE users SET enabled = ? WHERE id = ?")
                .bind(if enabled { 1 } else { 0 })
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        }
        if let Some(email) = email {
            sqlx::query("UPDATE users SET email = ? WHERE id = ?")
                .bind(email)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        }
        self.get_user_by_id(id).await
    }

    /// Deletes a user together with its API keys and their usage rows.
    pub async fn delete_user(&self, id: &str) -> Result<Vec<String>, String> {
        let keys = self.list_user_api_keys(id).await?;
        let key_ids: Vec<String> = keys.into_iter().map(|k| k.id).collect();
        for key_id in &key_ids {
            sqlx::query("DELETE FROM token_usage WHERE api_key_id = ?")
                .bind(key_id)
                .execute(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        }
        sqlx::query("DELETE FROM api_keys WHERE user_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(key_ids)
    }

    pub async fn create_api_key(&self, input: CreateApiKeyInput) -> Result<ApiKey, String> {
        let key = ApiKey {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: input.user_id,
            key: format!("mg-{}", uuid::Uuid::new_v4().to_string().replace("-", "")),
            name: input.name,
            enabled: true,
            max_tokens_per_day: input.max_tokens_per_day,
            max_tokens_per_month: input.max_tokens_per_month,
            rate_limit_per_minute: input.rate_limit_per_minute,
            max_concurrent_sessions: input.max_concurrent_sessions,
            created_at: Utc::now(),
            last_used_at: None,
        };
        sqlx::query(
            r#"INSERT INTO api_keys (id, user_id, key, name, enabled, max_tokens_per_day,
               max_tokens_per_month, rate_limit_per_minute, max_concurrent_sessions, created_at)
               VALUES (?, ?, ?, ?, 1, ?, ?, ?, ?, ?)"#,
        )
        .bind(&key.id)
        .bind(&key.user_id)
        .bind(&key.key)
        .bind(&key.name)
        .bind(key.max_tokens_per_day)
        .bind(key.max_tokens_per_month)
        .bind(key.rate_limit_per_minute)
        .bind(key.max_concurrent_sessions)
        .bind(key.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(key)
    }

    pub async fn get_api_key_by_id(&self, id: &str) -> Result<Option<ApiKey>, String> {
        let row = sqlx::query(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.map(|row| row_to_api_key(&row)).transpose()
    }

    /// Exact-match secret lookup. The secret column is unique-indexed so this
    /// is a point query.
    pub async fn get_api_key_by_secret(&self, secret: &str) -> Result<Option<ApiKey>, String> {
        let row = sqlx::query(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key = ?"
        ))
        .bind(secret)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.map(|row| row_to_api_key(&row)).transpose()
    }

    pub async fn list_api_keys(&self) -> Result<Vec<ApiKey>, String> {
        let rows = sqlx::query(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_api_key).collect()
    }

    pub async fn list_user_api_keys(&self, user_id: &str) -> Result<Vec<ApiKey>, String> {
        let rows = sqlx::query(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE user_id = ? ORDER BY created_at ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_api_key).collect()
    }

    pub async fn update_api_key(
        &self,
        id: &str,
        input: UpdateApiKeyInput,
    ) -> Result<Option<ApiKey>, String> {
        if let Some(name) = &input.name {
            sqlx::query("UPDATE api_keys SET name = ? WHERE id = ?")
                .bind(name)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        }
        if let Some(enabled) = input.enabled {
            sqlx::query("UPDATE api_keys SET enabled = ? WHERE id = ?")
                .bind(if enabled { 1 } else { 0 })
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        }
        let limit_updates = [
            ("max_tokens_per_day", input.max_tokens_per_day),
            ("max_tokens_per_month", input.max_tokens_per_month),
            ("rate_limit_per_minute", input.rate_limit_per_minute),
            ("max_concurrent_sessions", input.max_concurrent_sessions),
        ];
        for (column, value) in limit_updates {
            if let Some(value) = value {
                sqlx::query(&format!("UPDATE api_keys SET {column} = ? WHERE id = ?"))
                    .bind(value)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| e.to_string())?;
            }
        }
        self.get_api_key_by_id(id).await
    }

    pub async fn delete_api_key(&self, id: &str) -> Result<bool, String> {
        sqlx::query("DELETE FROM token_usage WHERE api_key_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_api_key_last_used(&self, id: &str) -> Result<(), String> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Resolves a presented secret to its key and owning user. Returns `None`
    /// when the secret is unknown or either side is disabled; a disabled user
    /// makes all of its keys invalid without touching them.
    pub async fn validate_api_key(&self, secret: &str) -> Result<Option<(ApiKey, User)>, String> {
        let api_key = match self.get_api_key_by_secret(secret).await? {
            Some(k) => k,
            None => return Ok(None),
        };
        if !api_key.enabled {
            return Ok(None);
        }
        let user = match self.get_user_by_id(&api_key.user_id).await? {
            Some(u) => u,
            None => return Ok(None),
        };
        if !user.enabled {
            return Ok(None);
        }
        self.update_api_key_last_used(&api_key.id).await?;
        Ok(Some((api_key, user)))
    }
}

const API_KEY_COLUMNS: &str = "id, user_id, key, name, enabled, max_tokens_per_day, \
     max_tokens_per_month, rate_limit_per_minute, max_concurrent_sessions, created_at, last_used_at";

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User, String> {
    Ok(User {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        username: row.try_get("username").map_err(|e| e.to_string())?,
        email: row.try_get("email").map_err(|e| e.to_string())?,
        enabled: row.try_get::<i32, _>("enabled").map_err(|e| e.to_string())? == 1,
        created_at: parse_rfc3339(
            &row.try_get::<String, _>("created_at")
                .map_err(|e| e.to_string())?,
        )?,
    })
}

fn row_to_api_key(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKey, String> {
    let last_used_at: Option<String> = row.try_get("last_used_at").map_err(|e| e.to_string())?;
    Ok(ApiKey {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        key: row.try_get("key").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        enabled: row.try_get::<i32, _>("enabled").map_err(|e| e.to_string())? == 1,
        max_tokens_per_day: row
            .try_get("max_tokens_per_day")
            .map_err(|e| e.to_string())?,
        max_tokens_per_month: row
            .try_get("max_tokens_per_month")
            .map_err(|e| e.to_string())?,
        rate_limit_per_minute: row
            .try_get("rate_limit_per_minute")
            .map_err(|e| e.to_string())?,
        max_concurrent_sessions: row
            .try_get("max_concurrent_sessions")
            .map_err(|e| e.to_string())?,
        created_at: parse_rfc3339(
            &row.try_get::<String, _>("created_at")
                .map_err(|e| e.to_string())?,
        )?,
        last_used_at: last_used_at.as_deref().map(parse_rfc3339).transpose()?,
    })
}
