use async_trait::async_trait;
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use redis::AsyncCommands;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tracing::warn;

const WINDOW_SECS: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit store error: {0}")]
    Store(String),
}

/// Counts a hit against the fixed one-minute window holding `key` and
/// returns the running count within that window.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn hit(&self, key: &str) -> Result<u64, RateLimitError>;
}

/// Per-process fixed-window counters. Each replica counts independently, so
/// the effective budget multiplies by replica count; behind a load balancer
/// use the shared store instead.
pub struct MemoryStore {
    windows: Arc<Mutex<HashMap<String, (u64, i64)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let windows: Arc<Mutex<HashMap<String, (u64, i64)>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Sweep entries whose window ended.
        let sweep = Arc::clone(&windows);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let now = Utc::now().timestamp();
                sweep
                    .lock()
                    .expect("rate limit window lock poisoned")
                    .retain(|_, (_, window_start)| now - *window_start < WINDOW_SECS);
            }
        });

        Self { windows }
    }

    fn hit_at(&self, key: &str, now: i64) -> u64 {
        let mut windows = self
            .windows
            .lock()
            .expect("rate limit window lock poisoned");
        let entry = windows.entry(key.to_string()).or_insert((0, now));
        if now - entry.1 >= WINDOW_SECS {
            *entry = (0, now);
        }
        entry.0 += 1;
        entry.0
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn hit(&self, key: &str) -> Result<u64, RateLimitError> {
        Ok(self.hit_at(key, Utc::now().timestamp()))
    }
}

/// Redis-backed counters: INCR plus EXPIRE on the first hit in a window.
/// All replicas share one budget.
pub struct SharedStore {
    conn: redis::aio::ConnectionManager,
}

impl SharedStore {
    pub async fn connect(
        addr: &str,
        password: Option<&str>,
        db: i64,
    ) -> Result<Self, RateLimitError> {
        let url = if addr.starts_with("redis://") || addr.starts_with("rediss://") {
            addr.to_string()
        } else {
            match password {
                Some(p) if !p.is_empty() => format!("redis://:{}@{}/{}", p, addr, db),
                _ => format!("redis://{}/{}", addr, db),
            }
        };

        let client = redis::Client::open(url)
            .map_err(|e| RateLimitError::Store(format!("failed to connect to Redis: {}", e)))?;
        let mut conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| RateLimitError::Store(format!("failed to connect to Redis: {}", e)))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::Store(format!("failed to connect to Redis: {}", e)))?;
        if pong != "PONG" {
            return Err(RateLimitError::Store(
                "failed to connect to Redis: unexpected PING reply".to_string(),
            ));
        }

        Ok(Self { conn })
    }
}

#[async_trait]
impl RateLimitStore for SharedStore {
    async fn hit(&self, key: &str) -> Result<u64, RateLimitError> {
        let mut conn = self.conn.clone();
        let count: u64 = conn
            .incr(key, 1u64)
            .await
            .map_err(|e| RateLimitError::Store(e.to_string()))?;
        if count == 1 {
            let _: bool = conn
                .expire(key, WINDOW_SECS)
                .await
                .map_err(|e| RateLimitError::Store(e.to_string()))?;
        }
        Ok(count)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    trust_proxy_headers: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, trust_proxy_headers: bool) -> Self {
        Self {
            store,
            trust_proxy_headers,
        }
    }

    /// Check a hit for (route, client-ip). Over budget answers with the
    /// uniform 429 body and a retry hint.
    pub async fn check(
        &self,
        route: &str,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        budget: u64,
    ) -> Result<(), Response> {
        let ip = client_ip(headers, peer, self.trust_proxy_headers);
        let key = format!("ratelimit:{}:{}", route, ip);
        match self.store.hit(&key).await {
            Ok(count) if count > budget => Err(too_many_requests()),
            Ok(_) => Ok(()),
            Err(e) => {
                // fail open when the store is unreachable
                warn!(route, error = %e, "rate limit store unavailable, allowing request");
                Ok(())
            }
        }
    }
}

/// Left-most X-Forwarded-For entry wins when proxy headers are trusted;
/// otherwise the socket peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            return forwarded.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn too_many_requests() -> Response {
    let mut resp = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "rate_limit_exceeded",
            "error_description": "Too many requests, please try again later"
        })),
    )
        .into_response();
    resp.headers_mut().insert(
        axum::http::header::RETRY_AFTER,
        axum::http::HeaderValue::from_static("60"),
    );
    resp
}

type MiddlewareFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Route middleware for `axum::middleware::from_fn`. A `None` limiter means
/// rate limiting is disabled and requests pass through.
pub fn middleware(
    limiter: Option<RateLimiter>,
    route: &'static str,
    budget: u64,
) -> impl Fn(Request, Next) -> MiddlewareFuture + Clone + Send + Sync + 'static {
    move |req: Request, next: Next| {
        let limiter = limiter.clone();
        Box::pin(async move {
            let Some(limiter) = limiter else {
                return next.run(req).await;
            };
            let peer = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            match limiter.check(route, req.headers(), peer, budget).await {
                Ok(()) => next.run(req).await,
                Err(resp) => resp,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_counts_within_window() {
        let store = MemoryStore::new();
        let now = 1_000_000;
        for expected in 1..=5 {
            assert_eq!(store.hit_at("ratelimit:test:10.0.0.1", now), expected);
        }
    }

    #[tokio::test]
    async fn memory_store_resets_after_window() {
        let store = MemoryStore::new();
        let now = 1_000_000;
        assert_eq!(store.hit_at("ratelimit:test:10.0.0.1", now), 1);
        assert_eq!(store.hit_at("ratelimit:test:10.0.0.1", now + 30), 2);
        assert_eq!(store.hit_at("ratelimit:test:10.0.0.1", now + WINDOW_SECS), 1);
    }

    #[tokio::test]
    async fn memory_store_isolates_keys() {
        let store = MemoryStore::new();
        let now = 1_000_000;
        for _ in 0..3 {
            store.hit_at("ratelimit:test:192.168.1.1", now);
        }
        assert_eq!(store.hit_at("ratelimit:test:192.168.1.2", now), 1);
    }

    #[test]
    fn client_ip_prefers_forwarded_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();

        assert_eq!(client_ip(&headers, Some(peer), true), "203.0.113.7");
        assert_eq!(client_ip(&headers, Some(peer), false), "192.0.2.1");
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer), true), "192.0.2.1");
        assert_eq!(client_ip(&HeaderMap::new(), None, false), "unknown");
    }

    #[tokio::test]
    async fn limiter_rejects_over_budget() {
        let store: Arc<dyn RateLimitStore> = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store, false);
        let peer: SocketAddr = "192.0.2.9:443".parse().unwrap();
        let headers = HeaderMap::new();

        for _ in 0..2 {
            limiter
                .check("login", &headers, Some(peer), 2)
                .await
                .expect("within budget");
        }
        let rejected = limiter.check("login", &headers, Some(peer), 2).await;
        assert!(rejected.is_err());
    }
}
