//! Replicated counter backend with Redis semantics.
//!
//! Maps the `CounterStore` trait directly onto `INCRBY`/`GET`/`PTTL`/
//! `PEXPIRE`/`DEL`. Connections are short blocking calls guarded by a
//! mutex; rate-limit keys are tiny and the round trips are sub-millisecond
//! on a co-located store.

use std::sync::Mutex;
use std::time::Duration;

use redis::Commands;
use tracing::warn;

use crate::store::CounterStore;

pub struct RedisStore {
    conn: Mutex<redis::Connection>,
}

impl RedisStore {
    pub fn connect(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CounterStore for RedisStore {
    fn incr(&self, key: &str, by: i64) -> i64 {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match conn.incr(key, by) {
            Ok(v) => v,
            Err(e) => {
                // Fail open: a broken limiter backend must not take the
                // gateway down with it.
                warn!(key, error = %e, "Replicated store INCRBY failed");
                0
            }
        }
    }

    fn get(&self, key: &str) -> Option<i64> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.get::<_, Option<i64>>(key).ok().flatten()
    }

    fn ttl(&self, key: &str) -> Option<Duration> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let ms: i64 = conn.pttl(key).ok()?;
        (ms > 0).then(|| Duration::from_millis(ms as u64))
    }

    fn expire(&self, key: &str, ttl: Duration) {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = conn.pexpire::<_, ()>(key, ttl.as_millis() as i64) {
            warn!(key, error = %e, "Replicated store PEXPIRE failed");
        }
    }

    fn del(&self, key: &str) {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = conn.del::<_, ()>(key) {
            warn!(key, error = %e, "Replicated store DEL failed");
        }
    }
}
