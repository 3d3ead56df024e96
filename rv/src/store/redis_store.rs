//! Redis-backed coordination store
//!
//! Counters are plain string keys (`INCR`/`MGET`), logs are streams
//! (`XADD`/`XREAD`/`XRANGE`) carrying the payload under field `p`.
//! Non-blocking commands share one multiplexed connection; every
//! [`LogReader`] gets its own connection so a blocking `XREAD` never stalls
//! other callers.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use tracing::{debug, info, warn};

use super::{Appended, CoordinationStore, LogReader, RecordId, StreamBatch, StreamRecord};
use crate::config::StoreConfig;
use crate::error::StoreError;

/// Stream field holding the serialized payload
pub const PAYLOAD_FIELD: &str = "p";

/// Coordination store backed by a Redis server
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    dial_timeout: Duration,
}

impl RedisStore {
    /// Connect and ping, retrying with bounded backoff
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config.url();
        debug!(%url, attempts = config.connect_attempts, "RedisStore::connect: called");
        let client = redis::Client::open(url.as_str())?;
        let backoff = config.backoff();
        let attempts = config.connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff.delay(attempt - 1)).await;
            }
            match dial(&client, config.dial_timeout()).await {
                Ok(conn) => {
                    info!(%url, attempt, "redis ping OK");
                    return Ok(Self {
                        client,
                        conn,
                        dial_timeout: config.dial_timeout(),
                    });
                }
                Err(e) => {
                    warn!(%url, attempt, error = %e, "failed to ping redis host");
                    last_error = e.to_string();
                }
            }
        }

        Err(StoreError::Connection(format!(
            "failed to connect to {url} after {attempts} attempts: {last_error}"
        )))
    }
}

async fn dial(client: &redis::Client, timeout: Duration) -> Result<MultiplexedConnection, StoreError> {
    let mut conn = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
        .await
        .map_err(|_| StoreError::Connection(format!("dial timed out after {timeout:?}")))??;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(conn)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn counters(&self, keys: &[String]) -> Result<Vec<i64>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<i64>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values.into_iter().map(|v| v.unwrap_or(0)).collect())
    }

    async fn append(&self, key: &str, payload: &[u8]) -> Result<Appended, StoreError> {
        let mut conn = self.conn.clone();
        let (id, len): (String, u64) = redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(key)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .cmd("XLEN")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(Appended {
            id: id.parse()?,
            position: len,
        })
    }

    async fn first_record(&self, key: &str) -> Result<Option<StreamRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;
        reply.ids.into_iter().next().map(|entry| record(key, entry)).transpose()
    }

    async fn open_reader(&self) -> Result<Box<dyn LogReader>, StoreError> {
        debug!("RedisStore::open_reader: dialing dedicated connection");
        let conn = dial(&self.client, self.dial_timeout).await?;
        Ok(Box::new(RedisReader { conn }))
    }
}

struct RedisReader {
    conn: MultiplexedConnection,
}

#[async_trait]
impl LogReader for RedisReader {
    async fn read(
        &mut self,
        cursors: &[(String, RecordId)],
        block: Option<Duration>,
        count: usize,
    ) -> Result<Vec<StreamBatch>, StoreError> {
        if cursors.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT").arg(count);
        if let Some(block) = block {
            // BLOCK 0 means forever
            cmd.arg("BLOCK").arg((block.as_millis() as u64).max(1));
        }
        cmd.arg("STREAMS");
        for (key, _) in cursors {
            cmd.arg(key);
        }
        for (_, cursor) in cursors {
            cmd.arg(cursor.to_string());
        }

        let reply: Option<StreamReadReply> = cmd.query_async(&mut self.conn).await?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        reply
            .keys
            .into_iter()
            .map(|stream| {
                let records = stream
                    .ids
                    .into_iter()
                    .map(|entry| record(&stream.key, entry))
                    .collect::<Result<Vec<_>, StoreError>>()?;
                Ok(StreamBatch {
                    key: stream.key,
                    records,
                })
            })
            .collect()
    }
}

fn record(key: &str, entry: StreamId) -> Result<StreamRecord, StoreError> {
    let value = entry
        .map
        .get(PAYLOAD_FIELD)
        .ok_or_else(|| StoreError::Command(format!("record {} on {key} has no payload", entry.id)))?;
    Ok(StreamRecord {
        id: entry.id.parse()?,
        payload: redis::from_redis_value(value)?,
    })
}
