use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use chrono::NaiveDate;
use diesel::connection::SimpleConnection;
use diesel::PgConnection;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use tourdesk::auth::jwt::JwtService;
use tourdesk::auth::UserRole;
use tourdesk::config::AppConfig;
use tourdesk::db::{self, PgPool};
use tourdesk::notifications::NotificationHub;
use tourdesk::participation::{MemoryParticipationStore, Tour, TourStatus};
use tourdesk::routes;
use tourdesk::state::AppState;
use uuid::Uuid;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

// enough connections for the concurrent store tests to interleave
const TEST_POOL_SIZE: u32 = 6;

pub struct TestApp {
    pub state: AppState,
    router: Router,
    store: Arc<MemoryParticipationStore>,
}

impl TestApp {
    pub fn new() -> Result<Self> {
        let config = AppConfig::new("postgres://localhost/tourdesk_test", "test-secret");
        let store = Arc::new(MemoryParticipationStore::new());
        let hub = Arc::new(NotificationHub::new());
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(config, store.clone(), hub, jwt);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            store,
        })
    }

    #[allow(dead_code)]
    pub fn store(&self) -> Arc<MemoryParticipationStore> {
        self.store.clone()
    }

    pub fn insert_tour(&self, name: &str, start: NaiveDate, end: NaiveDate) -> Uuid {
        let id = Uuid::new_v4();
        self.store.insert_tour(Tour {
            id,
            name: name.to_string(),
            start_date: start,
            end_date: end,
            status: TourStatus::Planned,
            participant_count: 0,
        });
        id
    }

    /// Mints a token for a fresh user and returns `(user_id, token)`.
    pub fn login(&self, username: &str, role: UserRole) -> Result<(Uuid, String)> {
        let user_id = Uuid::new_v4();
        let token = self.state.jwt.generate_token(user_id, username, role)?;
        Ok((user_id, token))
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn post_empty(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::POST).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let builder = Request::builder().method(Method::DELETE).uri(path);
        let builder = if let Some(token) = token {
            builder.header("authorization", format!("Bearer {token}"))
        } else {
            builder
        };
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    /// Opens the notification stream and consumes the connected acknowledgment.
    #[allow(dead_code)]
    pub async fn open_stream(&self, token: &str) -> Result<SseReader> {
        let response = self.get("/api/notifications/stream", Some(token)).await?;
        if !response.status().is_success() {
            bail!("stream refused with status {}", response.status());
        }
        let mut reader = SseReader::new(response.into_body());
        match reader.next_event().await? {
            SseEvent::Data(ack) if ack["data"]["event"] == "connected" => Ok(reader),
            other => bail!("expected connected acknowledgment, got {other:?}"),
        }
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Data(Value),
    Heartbeat,
}

/// Reads `data:` and comment events off a streaming response body.
#[allow(dead_code)]
pub struct SseReader {
    body: Body,
    buffer: String,
}

#[allow(dead_code)]
impl SseReader {
    pub fn new(body: Body) -> Self {
        Self {
            body,
            buffer: String::new(),
        }
    }

    pub async fn next_event(&mut self) -> Result<SseEvent> {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let raw: String = self.buffer.drain(..end + 2).collect();
                return parse_event(raw.trim_end());
            }

            let frame = tokio::time::timeout(FRAME_TIMEOUT, self.body.frame())
                .await
                .context("timed out waiting for an event")?
                .ok_or_else(|| anyhow!("stream ended"))?
                .map_err(|err| anyhow!("failed to read stream: {err}"))?;
            if let Ok(data) = frame.into_data() {
                self.buffer.push_str(std::str::from_utf8(&data)?);
            }
        }
    }

    /// Asserts that nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) -> Result<()> {
        if !self.buffer.is_empty() {
            bail!("unexpected buffered data: {:?}", self.buffer);
        }
        match tokio::time::timeout(wait, self.body.frame()).await {
            Err(_) => Ok(()),
            Ok(None) => bail!("stream ended"),
            Ok(Some(frame)) => bail!("unexpected frame: {frame:?}"),
        }
    }

    /// Waits for the stream to finish, e.g. after the hub dropped the channel.
    pub async fn expect_closed(&mut self) -> Result<()> {
        loop {
            match tokio::time::timeout(FRAME_TIMEOUT, self.body.frame())
                .await
                .context("stream still open")?
            {
                None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(err)) => bail!("stream failed: {err}"),
            }
        }
    }
}

fn parse_event(raw: &str) -> Result<SseEvent> {
    if raw == ":heartbeat" {
        return Ok(SseEvent::Heartbeat);
    }
    let payload = raw
        .strip_prefix("data: ")
        .ok_or_else(|| anyhow!("unexpected event: {raw:?}"))?;
    Ok(SseEvent::Data(serde_json::from_str(payload)?))
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

#[allow(dead_code)]
pub async fn body_json(response: hyper::Response<Body>) -> Result<Value> {
    let body = body_to_vec(response.into_body()).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[allow(dead_code)]
pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

#[allow(dead_code)]
pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

/// Migrated and emptied pool for `TEST_DATABASE_URL`, or `None` when unset.
#[allow(dead_code)]
pub async fn test_pool() -> Result<Option<PgPool>> {
    let Ok(database_url) = env::var("TEST_DATABASE_URL") else {
        return Ok(None);
    };
    let pool = db::init_pool_with_size(&database_url, TEST_POOL_SIZE)?;
    let migration_pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        db::run_migrations(&migration_pool)?;
        let mut conn = migration_pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        truncate_all(&mut conn)
    })
    .await
    .context("migration task panicked")??;
    Ok(Some(pool))
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute("TRUNCATE TABLE tour_participants, tours RESTART IDENTITY CASCADE;")
        .context("failed to truncate tables")?;
    Ok(())
}
