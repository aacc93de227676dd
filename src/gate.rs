use crate::error::AppError;
use crate::usage::UsageStore;
use crate::users::{ApiKey, User, UserStore};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

const RATE_WINDOW_SECONDS: i64 = 60;

/// Shared per-key admission state. Rate-window timestamps and the in-flight
/// session count are mutated under the map's shard lock so a
/// check-then-increment can never over-admit past a configured limit.
#[derive(Debug, Default)]
struct KeyGateState {
    window: VecDeque<DateTime<Utc>>,
    in_flight: u32,
}

/// A successfully admitted request. Dropping the guard releases the
/// concurrency slot; until `mark_backend_started` is called, dropping also
/// rolls the rate-window entry back so a request that never reached the
/// backend does not consume rate budget.
#[derive(Debug)]
pub struct Admission {
    pub api_key: ApiKey,
    pub user: User,
    pub guard: SessionGuard,
}

#[derive(Debug)]
pub struct SessionGuard {
    states: Arc<DashMap<String, KeyGateState>>,
    api_key_id: String,
    admitted_at: DateTime<Utc>,
    backend_started: bool,
}

impl SessionGuard {
    /// Latches the admission: from here on the rate-window entry stands even
    /// if the request subsequently fails.
    pub fn mark_backend_started(&mut self) {
        self.backend_started = true;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(mut state) = self.states.get_mut(&self.api_key_id) {
            state.in_flight = state.in_flight.saturating_sub(1);
            if !self.backend_started {
                if let Some(pos) = state.window.iter().position(|ts| *ts == self.admitted_at) {
                    state.window.remove(pos);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct Gate {
    users: UserStore,
    usage: UsageStore,
    states: Arc<DashMap<String, KeyGateState>>,
}

impl Gate {
    pub fn new(users: UserStore, usage: UsageStore) -> Self {
        Self {
            users,
            usage,
            states: Arc::new(DashMap::new()),
        }
    }

    /// Admits or rejects a request for the given bearer secret. Checks run
    /// in order: credential, rate limit, concurrency, quota.
    pub async fn admit(&self, secret: &str) -> Result<Admission, AppError> {
        let (api_key, user) = self
            .users
            .validate_api_key(secret)
            .await
            .map_err(AppError::internal)?
            .ok_or_else(|| AppError::unauthorized("invalid or disabled API key"))?;

        let now = Utc::now();

        // Read-only pass keeps the configured rejection order even though the
        // quota check below has to leave the shard lock for the database.
        {
            let mut state = self.states.entry(api_key.id.clone()).or_default();
            prune_window(&mut state.window, now);
            if state.window.len() as i64 >= api_key.rate_limit_per_minute {
                return Err(AppError::rate_limited(format!(
                    "rate limit of {} requests per minute exceeded",
                    api_key.rate_limit_per_minute
                )));
            }
            if state.in_flight as i64 >= api_key.max_concurrent_sessions {
                return Err(AppError::too_many_sessions(format!(
                    "maximum of {} concurrent sessions reached",
                    api_key.max_concurrent_sessions
                )));
            }
        }

        let tokens_today = self
            .usage
            .tokens_today(&api_key.id)
            .await
            .map_err(AppError::internal)?;
        if tokens_today >= api_key.max_tokens_per_day {
            return Err(AppError::quota_exceeded(format!(
                "daily token quota of {} exhausted",
                api_key.max_tokens_per_day
            )));
        }
        let tokens_month = self
            .usage
            .tokens_this_month(&api_key.id)
            .await
            .map_err(AppError::internal)?;
        if tokens_month >= api_key.max_tokens_per_month {
            return Err(AppError::quota_exceeded(format!(
                "monthly token quota of {} exhausted",
                api_key.max_tokens_per_month
            )));
        }

        // Commit pass: re-check and mutate under one shard lock.
        let admitted_at = Utc::now();
        {
            let mut state = self.states.entry(api_key.id.clone()).or_default();
            prune_window(&mut state.window, admitted_at);
            if state.window.len() as i64 >= api_key.rate_limit_per_minute {
                return Err(AppError::rate_limited(format!(
                    "rate limit of {} requests per minute exceeded",
                    api_key.rate_limit_per_minute
                )));
            }
            if state.in_flight as i64 >= api_key.max_concurrent_sessions {
                return Err(AppError::too_many_sessions(format!(
                    "maximum of {} concurrent sessions reached",
                    api_key.max_concurrent_sessions
                )));
            }
            state.window.push_back(admitted_at);
            state.in_flight += 1;
        }

        let guard = SessionGuard {
            states: self.states.clone(),
            api_key_id: api_key.id.clone(),
            admitted_at,
            backend_started: false,
        };
        Ok(Admission {
            api_key,
            user,
            guard,
        })
    }

    /// Post-response quota check. Recorded usage already feeds the next
    /// `admit`; this only surfaces the crossing in the logs.
    pub async fn note_usage_recorded(&self, api_key: &ApiKey) {
        if let Ok(tokens_today) = self.usage.tokens_today(&api_key.id).await {
            if tokens_today >= api_key.max_tokens_per_day {
                tracing::debug!(
                    api_key_id = %api_key.id,
                    tokens_today,
                    max_tokens_per_day = api_key.max_tokens_per_day,
                    "api key crossed its daily token quota"
                );
            }
        }
        if let Ok(tokens_month) = self.usage.tokens_this_month(&api_key.id).await {
            if tokens_month >= api_key.max_tokens_per_month {
                tracing::debug!(
                    api_key_id = %api_key.id,
                    tokens_month,
                    max_tokens_per_month = api_key.max_tokens_per_month,
                    "api key crossed its monthly token quota"
                );
            }
        }
    }

    /// Drops cached gate state for keys that no longer exist.
    pub fn forget_keys(&self, api_key_ids: &[String]) {
        for id in api_key_ids {
            self.states.remove(id);
        }
    }
}

fn prune_window(window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    let cutoff = now - Duration::seconds(RATE_WINDOW_SECONDS);
    while let Some(front) = window.front() {
        if *front < cutoff {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::TokenCounts;
    use crate::users::CreateApiKeyInput;

    async fn test_gate() -> (Gate, UserStore, UsageStore) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let users = UserStore::new(pool.clone()).await.unwrap();
        let usage = UsageStore::new(pool).await.unwrap();
        (Gate::new(users.clone(), usage.clone()), users, usage)
    }

    async fn seeded_key(
        users: &UserStore,
        rate_limit_per_minute: i64,
        max_concurrent_sessions: i64,
        max_tokens_per_day: i64,
    ) -> ApiKey {
        let user = users.create_user("alice", None).await.unwrap();
        users
            .create_api_key(CreateApiKeyInput {
                user_id: user.id,
                name: "test".to_string(),
                max_tokens_per_day,
                max_tokens_per_month: 1_000_000,
                rate_limit_per_minute,
                max_concurrent_sessions,
            })
            .await
            .unwrap()
    }

    #[test]
    fn prune_drops_only_expired_entries() {
        let now = Utc::now();
        let mut window = VecDeque::from(vec![
            now - Duration::seconds(120),
            now - Duration::seconds(61),
            now - Duration::seconds(59),
            now,
        ]);
        prune_window(&mut window, now);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0], now - Duration::seconds(59));
    }

    #[tokio::test]
    async fn unknown_secret_is_unauthorized() {
        let (gate, _, _) = test_gate().await;
        let err = gate.admit("mg-nope").await.unwrap_err();
        assert_eq!(err.code, "unauthorized");
    }

    #[tokio::test]
    async fn disabled_user_invalidates_its_keys() {
        let (gate, users, _) = test_gate().await;
        let key = seeded_key(&users, 10, 5, 1000).await;
        users
            .update_user(&key.user_id, Some(false), None)
            .await
            .unwrap();
        let err = gate.admit(&key.key).await.unwrap_err();
        assert_eq!(err.code, "unauthorized");
    }

    #[tokio::test]
    async fn rate_limit_rejects_excess_requests() {
        let (gate, users, _) = test_gate().await;
        let key = seeded_key(&users, 2, 10, 1000).await;

        let first = gate.admit(&key.key).await.unwrap();
        let mut guard = first.guard;
        guard.mark_backend_started();
        drop(guard);
        let second = gate.admit(&key.key).await.unwrap();
        let mut guard = second.guard;
        guard.mark_backend_started();
        drop(guard);

        let err = gate.admit(&key.key).await.unwrap_err();
        assert_eq!(err.code, "rate_limited");
    }

    #[tokio::test]
    async fn rolled_back_admission_frees_rate_budget() {
        let (gate, users, _) = test_gate().await;
        let key = seeded_key(&users, 1, 10, 1000).await;

        // Dropped without reaching the backend: budget restored.
        drop(gate.admit(&key.key).await.unwrap());
        assert!(gate.admit(&key.key).await.is_ok());
    }

    #[tokio::test]
    async fn concurrency_limit_and_release() {
        let (gate, users, _) = test_gate().await;
        let key = seeded_key(&users, 100, 1, 1000).await;

        let held = gate.admit(&key.key).await.unwrap();
        let err = gate.admit(&key.key).await.unwrap_err();
        assert_eq!(err.code, "too_many_sessions");

        drop(held);
        assert!(gate.admit(&key.key).await.is_ok());
    }

    #[tokio::test]
    async fn daily_quota_rejects_once_reached() {
        let (gate, users, usage) = test_gate().await;
        let key = seeded_key(&users, 100, 10, 500).await;

        usage
            .record(
                &key.id,
                "m",
                TokenCounts {
                    prompt_tokens: 100,
                    completion_tokens: 400,
                    total_tokens: 500,
                },
            )
            .await
            .unwrap();

        let err = gate.admit(&key.key).await.unwrap_err();
        assert_eq!(err.code, "quota_exceeded");
    }

    #[tokio::test]
    async fn monthly_quota_rejects_once_reached() {
        let (gate, users, usage) = test_gate().await;
        let user = users.create_user("bob", None).await.unwrap();
        let key = users
            .create_api_key(CreateApiKeyInput {
                user_id: user.id,
                name: "test".to_string(),
                max_tokens_per_day: 100_000,
                max_tokens_per_month: 300,
                rate_limit_per_minute: 100,
                max_concurrent_sessions: 10,
            })
            .await
            .unwrap();

        usage
            .record(
                &key.id,
                "m",
                TokenCounts {
                    prompt_tokens: 200,
                    completion_tokens: 100,
                    total_tokens: 300,
                },
            )
            .await
            .unwrap();
        gate.note_usage_recorded(&key).await;

        let err = gate.admit(&key.key).await.unwrap_err();
        assert_eq!(err.code, "quota_exceeded");
    }
}
