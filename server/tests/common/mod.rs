//! Helpers shared by the store-backed test suites.
//!
//! These suites exercise a live Redis instance and are `#[ignore]`d by
//! default. Point `MARMOT_TEST_REDIS_URL` at a **disposable** database and
//! run `cargo test -- --ignored` to enable them.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use marmot_server::{
    api::{Level, Message},
    backend::Backend,
    config::RedisConfig,
};
use once_cell::sync::Lazy;
use tokio::sync::Mutex;

/// Serializes store-backed tests; `load` is a total state transition and
/// would otherwise wipe a concurrent test's fixtures.
pub static STORE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

static COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn redis_url() -> String {
    std::env::var("MARMOT_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1".to_string())
}

pub fn backend() -> Backend {
    Backend::new(&RedisConfig {
        url: redis_url(),
        ..RedisConfig::default()
    })
    .expect("backend handle")
}

/// Raw store connection for assertions on the key layout.
pub async fn store() -> redis::aio::MultiplexedConnection {
    redis::Client::open(redis_url())
        .expect("redis client")
        .get_multiplexed_async_connection()
        .await
        .expect("redis connection")
}

/// A name unique across test runs, matching the guid/channel convention.
pub fn unique(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_millis();
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{prefix}-{}-{millis}-{n}", std::process::id())
}

/// Unsigned envelope, enough for `push` (authorization happens upstream).
pub fn message(channel: &str, content: &str) -> Message {
    Message {
        channel: channel.to_string(),
        content: content.to_string(),
        whistler: "tester".to_string(),
        level: Level::Info,
        signature: String::new(),
    }
}
