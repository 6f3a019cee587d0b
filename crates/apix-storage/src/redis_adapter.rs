use crate::error::StorageError;
use crate::traits::{KvStore, LogAdapter, StreamEntry};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// `LogAdapter` + `KvStore` backed by Redis, grounded in the same
/// client-wrapping shape as a plain cache client: open once, clone a
/// managed connection per call site, let `redis`'s `ConnectionManager`
/// handle reconnection transparently.
#[derive(Clone)]
pub struct RedisStorage {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStorage {
    pub async fn connect(redis_url: &str) -> Result<Self, StorageError> {
        let client = Client::open(redis_url).map_err(StorageError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(StorageError::from)?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl LogAdapter for RedisStorage {
    async fn append(
        &self,
        stream_key: &str,
        fields: &[(&str, &str)],
    ) -> Result<String, StorageError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream_key, "*", fields).await?;
        Ok(id)
    }

    async fn range(
        &self,
        stream_key: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: redis::streams::StreamRangeReply =
            conn.xrange_count(stream_key, start, end, count).await?;
        Ok(raw
            .ids
            .into_iter()
            .map(|id| StreamEntry {
                id: id.id.clone(),
                fields: map_from_stream_id(&id),
            })
            .collect())
    }

    async fn ensure_group(&self, stream_key: &str, group: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream_key, group, "0").await;
        if let Err(e) = result {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(StorageError::from(e));
            }
        }
        Ok(())
    }

    async fn read_group(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[stream_key], &[">"], &opts)
            .await?;
        Ok(reply
            .keys
            .into_iter()
            .flat_map(|k| k.ids)
            .map(|id| StreamEntry {
                id: id.id,
                fields: map_from_stream_id(&id),
            })
            .collect())
    }

    async fn ack(&self, stream_key: &str, group: &str, id: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream_key, group, &[id]).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StorageError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(StorageError::from)?;
        pubsub.subscribe(channel).await.map_err(StorageError::from)?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "failed to decode pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

fn map_from_stream_id(id: &redis::streams::StreamId) -> HashMap<String, String> {
    id.map
        .iter()
        .filter_map(|(k, v)| match v {
            redis::Value::BulkString(bytes) => {
                Some((k.clone(), String::from_utf8_lossy(bytes).into_owned()))
            }
            redis::Value::SimpleString(s) => Some((k.clone(), s.clone())),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl KvStore for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StorageError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StorageError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1).await?;
        if value == 1 {
            if let Some(ttl) = ttl {
                let _: () = conn.expire(key, ttl.as_secs().max(1) as i64).await?;
            }
        }
        Ok(value)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = match limit {
            Some(limit) => conn.zrangebyscore_limit(key, min, max, 0, limit as isize).await?,
            None => conn.zrangebyscore(key, min, max).await?,
        };
        Ok(members)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn.clone();
        let is_member: bool = conn.sismember(key, member).await?;
        Ok(is_member)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }
}
