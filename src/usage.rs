use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TokenCounts {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl TokenCounts {
    pub fn from_usage_value(usage: &Value) -> Self {
        let get = |key: &str| usage.get(key).and_then(|v| v.as_i64()).unwrap_or(0);
        Self {
            prompt_tokens: get("prompt_tokens"),
            completion_tokens: get("completion_tokens"),
            total_tokens: get("total_tokens"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub id: String,
    pub api_key_id: String,
    pub model_name: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub timestamp: DateTime<Utc>,
}

/// Append-only store of per-request token consumption. These rows are the
/// sole input to the gate's quota windows.
#[derive(Clone)]
pub struct UsageStore {
    pool: Pool<Sqlite>,
}

impl UsageStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS token_usage (
                id TEXT PRIMARY KEY,
                api_key_id TEXT NOT NULL,
                model_name TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_token_usage_key_ts ON token_usage(api_key_id, timestamp)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn record(
        &self,
        api_key_id: &str,
        model_name: &str,
        counts: TokenCounts,
    ) -> Result<UsageRecord, String> {
        let record = UsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            api_key_id: api_key_id.to_string(),
            model_name: model_name.to_string(),
            prompt_tokens: counts.prompt_tokens,
            completion_tokens: counts.completion_tokens,
            total_tokens: counts.total_tokens,
            timestamp: Utc::now(),
        };
        sqlx::query(
            r#"INSERT INTO token_usage (id, api_key_id, model_name, prompt_tokens, completion_tokens, total_tokens, timestamp)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&record.id)
        .bind(&record.api_key_id)
        .bind(&record.model_name)
        .bind(record.prompt_tokens)
        .bind(record.completion_tokens)
        .bind(record.total_tokens)
        .bind(record.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(record)
    }

    pub async fn tokens_since(
        &self,
        api_key_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, String> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(total_tokens), 0) AS total FROM token_usage WHERE api_key_id = ? AND timestamp >= ?",
        )
        .bind(api_key_id)
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.try_get("total").map_err(|e| e.to_string())
    }

    /// Tokens consumed by a key in the current UTC day.
    pub async fn tokens_today(&self, api_key_id: &str) -> Result<i64, String> {
        self.tokens_since(api_key_id, start_of_utc_day(Utc::now()))
            .await
    }

    /// Tokens consumed by a key in the current UTC month.
    pub async fn tokens_this_month(&self, api_key_id: &str) -> Result<i64, String> {
        self.tokens_since(api_key_id, start_of_utc_month(Utc::now()))
            .await
    }

    pub async fn stats(&self, api_key_id: Option<&str>, days: i64) -> Result<Value, String> {
        let cutoff = (Utc::now() - chrono::Duration::days(days.max(0))).to_rfc3339();
        let rows = if let Some(key_id) = api_key_id {
            sqlx::query(
                "SELECT model_name, total_tokens FROM token_usage WHERE api_key_id = ? AND timestamp >= ?",
            )
            .bind(key_id)
            .bind(&cutoff)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query("SELECT model_name, total_tokens FROM token_usage WHERE timestamp >= ?")
                .bind(&cutoff)
                .fetch_all(&self.pool)
                .await
        }
        .map_err(|e| e.to_string())?;

        let mut total_tokens: i64 = 0;
        let mut by_model: Map<String, Value> = Map::new();
        for row in &rows {
            let model: String = row.try_get("model_name").map_err(|e| e.to_string())?;
            let tokens: i64 = row.try_get("total_tokens").map_err(|e| e.to_string())?;
            total_tokens += tokens;
            let entry = by_model
                .entry(model)
                .or_insert_with(|| json!({"requests": 0, "tokens": 0}));
            if let Some(obj) = entry.as_object_mut() {
                let requests = obj.get("requests").and_then(|v| v.as_i64()).unwrap_or(0);
                let model_tokens = obj.get("tokens").and_then(|v| v.as_i64()).unwrap_or(0);
                obj.insert("requests".to_string(), json!(requests + 1));
                obj.insert("tokens".to_string(), json!(model_tokens + tokens));
            }
        }

        Ok(json!({
            "total_tokens": total_tokens,
            "total_requests": rows.len(),
            "by_model": Value::Object(by_model),
            "days": days,
        }))
    }

    pub async fn by_user(&self, days: i64) -> Result<Value, String> {
        let cutoff = (Utc::now() - chrono::Duration::days(days.max(0))).to_rfc3339();
        let rows = sqlx::query(
            r#"SELECT users.id AS user_id, users.username AS username,
                      COUNT(token_usage.id) AS requests,
                      COALESCE(SUM(token_usage.total_tokens), 0) AS tokens
               FROM token_usage
               JOIN api_keys ON api_keys.id = token_usage.api_key_id
               JOIN users ON users.id = api_keys.user_id
               WHERE token_usage.timestamp >= ?
               GROUP BY users.id, users.username"#,
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let mut users = Vec::with_capacity(rows.len());
        for row in &rows {
            users.push(json!({
                "user_id": row.try_get::<String, _>("user_id").map_err(|e| e.to_string())?,
                "username": row.try_get::<String, _>("username").map_err(|e| e.to_string())?,
                "requests": row.try_get::<i64, _>("requests").map_err(|e| e.to_string())?,
                "tokens": row.try_get::<i64, _>("tokens").map_err(|e| e.to_string())?,
            }));
        }
        Ok(json!({ "days": days, "users": users }))
    }

    pub async fn logs(&self, limit: i64) -> Result<Value, String> {
        let rows = sqlx::query(
            r#"SELECT token_usage.id AS id, token_usage.timestamp AS timestamp,
                      token_usage.model_name AS model_name,
                      token_usage.prompt_tokens AS prompt_tokens,
                      token_usage.completion_tokens AS completion_tokens,
                      token_usage.total_tokens AS total_tokens,
                      api_keys.name AS api_key_name,
                      users.id AS user_id, users.username AS username
               FROM token_usage
               JOIN api_keys ON api_keys.id = token_usage.api_key_id
               JOIN users ON users.id = api_keys.user_id
               ORDER BY token_usage.timestamp DESC
               LIMIT ?"#,
        )
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let mut logs = Vec::with_capacity(rows.len());
        for row in &rows {
            logs.push(json!({
                "id": row.try_get::<String, _>("id").map_err(|e| e.to_string())?,
                "timestamp": row.try_get::<String, _>("timestamp").map_err(|e| e.to_string())?,
                "model": row.try_get::<String, _>("model_name").map_err(|e| e.to_string())?,
                "prompt_tokens": row.try_get::<i64, _>("prompt_tokens").map_err(|e| e.to_string())?,
                "completion_tokens": row.try_get::<i64, _>("completion_tokens").map_err(|e| e.to_string())?,
                "total_tokens": row.try_get::<i64, _>("total_tokens").map_err(|e| e.to_string())?,
                "api_key_name": row.try_get::<String, _>("api_key_name").map_err(|e| e.to_string())?,
                "user_id": row.try_get::<String, _>("user_id").map_err(|e| e.to_string())?,
                "username": row.try_get::<String, _>("username").map_err(|e| e.to_string())?,
            }));
        }
        Ok(json!({ "logs": logs }))
    }
}

pub fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}

pub fn start_of_utc_month(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_parse_missing_fields_as_zero() {
        let counts = TokenCounts::from_usage_value(&json!({"prompt_tokens": 7}));
        assert_eq!(counts.prompt_tokens, 7);
        assert_eq!(counts.completion_tokens, 0);
        assert_eq!(counts.total_tokens, 0);
    }

    #[test]
    fn utc_window_starts() {
        let now = Utc.with_ymd_and_hms(2026, 8, 29, 17, 45, 12).unwrap();
        assert_eq!(
            start_of_utc_day(now),
            Utc.with_ymd_and_hms(2026, 8, 29, 0, 0, 0).unwrap()
        );
        assert_eq!(
            start_of_utc_month(now),
            Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap()
        );
    }
}
