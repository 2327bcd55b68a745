//! Redis Streams consumer-group source.
//!
//! Each partition is its own stream key. Redis stream ids are not dense, so
//! the adapter numbers entries per partition in the order it reads them and
//! keeps the offset-to-id mapping until the offset is committed (XACK).
//!
//! On startup the consumer first re-reads its own pending entries list (ids
//! delivered to this consumer but never acknowledged), then switches to new
//! entries (`>`).
//!
//! Because offsets are numbered by this process, they restart at zero with
//! every connection and `committed` is `None` until the first XACK of the
//! current run. Progress across restarts lives in the consumer group itself:
//! acknowledged entries are never handed out again, unacknowledged ones come
//! back through the pending list.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use tracing::{debug, info, instrument};

use orderflow_core::{Offset, PartitionId};
use orderflow_events::SourceRecord;

use super::{LogSource, SourceError};

const PAYLOAD_FIELD: &str = "payload";
const KEY_FIELD: &str = "key";
const TIMESTAMP_FIELD: &str = "timestamp";

#[derive(Debug)]
struct PartitionCursor {
    stream_key: String,
    next_offset: u64,
    stream_ids: BTreeMap<Offset, String>,
    committed: Option<Offset>,
    /// `Some(last id)` while replaying the pending entries list.
    replay_from: Option<String>,
}

impl PartitionCursor {
    fn new(stream_key: String) -> Self {
        Self {
            stream_key,
            next_offset: 0,
            stream_ids: BTreeMap::new(),
            committed: None,
            replay_from: Some("0".to_string()),
        }
    }

    /// Number a freshly read entry.
    fn assign(&mut self, stream_id: &str) -> Offset {
        let offset = Offset::new(self.next_offset);
        self.next_offset += 1;
        self.stream_ids.insert(offset, stream_id.to_string());
        offset
    }

    /// Stream ids to XACK when committing `offset`.
    fn ids_through(&self, offset: Offset) -> Result<Vec<String>, String> {
        if offset.get() >= self.next_offset {
            return Err(format!("offset was never consumed (next offset {})", self.next_offset));
        }
        Ok(self.stream_ids.range(..=offset).map(|(_, id)| id.clone()).collect())
    }

    fn acknowledged(&mut self, offset: Offset) {
        self.stream_ids = self.stream_ids.split_off(&offset.next());
        self.committed = Some(self.committed.map_or(offset, |c| c.max(offset)));
    }
}

pub struct RedisStreamsSource {
    name: String,
    conn: MultiplexedConnection,
    group: String,
    consumer: String,
    cursors: BTreeMap<PartitionId, Mutex<PartitionCursor>>,
}

impl std::fmt::Debug for RedisStreamsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsSource")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsSource {
    /// Connect and ensure the consumer group exists on every partition stream.
    ///
    /// With a single partition the stream key is `stream` itself; otherwise
    /// partition `n` reads `{stream}:{n}`.
    pub async fn connect(
        redis_url: &str,
        stream: &str,
        partitions: u32,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, SourceError> {
        let client = redis::Client::open(redis_url).map_err(|e| SourceError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        let partitions = partitions.max(1);
        let cursors = (0..partitions)
            .map(|p| {
                let stream_key = if partitions == 1 {
                    stream.to_string()
                } else {
                    format!("{stream}:{p}")
                };
                (PartitionId::new(p), Mutex::new(PartitionCursor::new(stream_key)))
            })
            .collect();

        let source = Self {
            name: stream.to_string(),
            conn,
            group: group.into(),
            consumer: consumer.into(),
            cursors,
        };
        source.ensure_consumer_groups().await?;
        Ok(source)
    }

    /// XGROUP CREATE ... MKSTREAM on every partition stream; an existing group is fine.
    async fn ensure_consumer_groups(&self) -> Result<(), SourceError> {
        let mut conn = self.conn.clone();
        for cursor in self.cursors.values() {
            let stream_key = lock(cursor).stream_key.clone();
            let created: redis::RedisResult<()> =
                conn.xgroup_create_mkstream(&stream_key, &self.group, "0").await;
            match created {
                Ok(()) => info!(stream_key = %stream_key, group = %self.group, "Created consumer group"),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(SourceError::Connection(format!("XGROUP CREATE failed: {e}"))),
            }
        }
        Ok(())
    }

    fn cursor(&self, partition: PartitionId) -> Result<MutexGuard<'_, PartitionCursor>, SourceError> {
        self.cursors
            .get(&partition)
            .map(lock)
            .ok_or(SourceError::UnknownPartition(partition))
    }

    async fn read_group(
        &self,
        partition: PartitionId,
        stream_key: &str,
        from: &str,
        max: usize,
    ) -> Result<Vec<StreamId>, SourceError> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max);
        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream_key], &[from], &options)
            .await
            .map_err(|e| SourceError::Poll {
                partition,
                message: format!("XREADGROUP failed: {e}"),
            })?;

        Ok(reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default())
    }
}

fn lock(cursor: &Mutex<PartitionCursor>) -> MutexGuard<'_, PartitionCursor> {
    cursor.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build a source record from stream entry fields. Unknown fields become headers.
fn to_source_record(partition: PartitionId, offset: Offset, entry: &StreamId) -> SourceRecord {
    let mut payload = Vec::new();
    let mut key = None;
    let mut timestamp = None;
    let mut headers = BTreeMap::new();

    for field in entry.map.keys() {
        let Some(value) = entry.get::<String>(field) else {
            continue;
        };
        match field.as_str() {
            PAYLOAD_FIELD => payload = value.into_bytes(),
            KEY_FIELD => key = Some(value),
            TIMESTAMP_FIELD => {
                timestamp = DateTime::parse_from_rfc3339(&value)
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            }
            _ => {
                headers.insert(field.clone(), value);
            }
        }
    }

    let mut record = SourceRecord::new(partition, offset, payload).with_timestamp(timestamp.unwrap_or_else(Utc::now));
    record.headers = headers;
    if let Some(key) = key {
        record = record.with_key(key);
    }
    record
}

#[async_trait]
impl LogSource for RedisStreamsSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn partitions(&self) -> Vec<PartitionId> {
        self.cursors.keys().copied().collect()
    }

    #[instrument(skip(self), fields(source = %self.name, partition = %partition), err)]
    async fn poll(&self, partition: PartitionId, max: usize) -> Result<Vec<SourceRecord>, SourceError> {
        let (stream_key, replay_from) = {
            let cursor = self.cursor(partition)?;
            (cursor.stream_key.clone(), cursor.replay_from.clone())
        };

        let entries = match replay_from {
            Some(last_id) => {
                let pending = self.read_group(partition, &stream_key, &last_id, max).await?;
                let mut cursor = self.cursor(partition)?;
                match pending.last() {
                    Some(entry) => {
                        debug!(count = pending.len(), "Replaying pending entries");
                        cursor.replay_from = Some(entry.id.clone());
                    }
                    None => cursor.replay_from = None,
                }
                pending
            }
            None => self.read_group(partition, &stream_key, ">", max).await?,
        };

        let mut cursor = self.cursor(partition)?;
        let records = entries
            .iter()
            .map(|entry| {
                let offset = cursor.assign(&entry.id);
                to_source_record(partition, offset, entry)
            })
            .collect();
        Ok(records)
    }

    #[instrument(skip(self), fields(source = %self.name, partition = %partition, offset = %offset), err)]
    async fn commit(&self, partition: PartitionId, offset: Offset) -> Result<(), SourceError> {
        let (stream_key, ids) = {
            let cursor = self.cursor(partition)?;
            let ids = cursor.ids_through(offset).map_err(|message| SourceError::Commit {
                partition,
                offset,
                message,
            })?;
            (cursor.stream_key.clone(), ids)
        };

        if !ids.is_empty() {
            let mut conn = self.conn.clone();
            let _: u64 = conn
                .xack(&stream_key, &self.group, &ids[..])
                .await
                .map_err(|e| SourceError::Commit {
                    partition,
                    offset,
                    message: format!("XACK failed: {e}"),
                })?;
        }

        self.cursor(partition)?.acknowledged(offset);
        Ok(())
    }

    /// Highest offset acknowledged by this connection; `None` after every
    /// restart, since offsets are renumbered from zero (see module docs).
    async fn committed(&self, partition: PartitionId) -> Result<Option<Offset>, SourceError> {
        Ok(self.cursor(partition)?.committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: "1700000000000-0".to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), redis::Value::Data(v.as_bytes().to_vec())))
                .collect(),
        }
    }

    #[test]
    fn stream_fields_map_to_record_parts() {
        let entry = entry(&[
            ("payload", r#"{"order_id":"ord_1"}"#),
            ("key", "cust_1"),
            ("event_type", "OrderCreated"),
            ("timestamp", "2024-01-15T10:30:00Z"),
        ]);

        let record = to_source_record(PartitionId::new(2), Offset::new(7), &entry);

        assert_eq!(record.partition, PartitionId::new(2));
        assert_eq!(record.offset, Offset::new(7));
        assert_eq!(record.key_str(), Some("cust_1"));
        assert_eq!(record.event_type(), Some("OrderCreated"));
        assert_eq!(record.payload, br#"{"order_id":"ord_1"}"#.to_vec());
        assert_eq!(record.timestamp.to_rfc3339(), "2024-01-15T10:30:00+00:00");
        assert!(record.header("payload").is_none());
    }

    #[test]
    fn commit_acknowledges_ids_through_the_offset() {
        let mut cursor = PartitionCursor::new("orders.created".to_string());
        for id in ["1-0", "2-0", "3-0"] {
            cursor.assign(id);
        }

        assert_eq!(cursor.ids_through(Offset::new(1)).unwrap(), vec!["1-0", "2-0"]);
        cursor.acknowledged(Offset::new(1));

        assert_eq!(cursor.committed, Some(Offset::new(1)));
        assert_eq!(cursor.ids_through(Offset::new(2)).unwrap(), vec!["3-0"]);
        assert!(cursor.ids_through(Offset::new(3)).is_err());
    }

    #[test]
    fn reconnect_renumbers_from_zero_with_nothing_committed() {
        let mut before = PartitionCursor::new("orders.created".to_string());
        before.assign("1-0");
        before.assign("2-0");
        before.acknowledged(Offset::new(0));

        // A new connection re-reads "2-0" from the pending list.
        let mut after = PartitionCursor::new("orders.created".to_string());

        assert_eq!(after.committed, None);
        assert_eq!(after.replay_from.as_deref(), Some("0"));
        assert_eq!(after.assign("2-0"), Offset::ZERO);
        assert_eq!(after.ids_through(Offset::ZERO).unwrap(), vec!["2-0"]);
    }

    #[test]
    fn missing_payload_yields_empty_record() {
        let record = to_source_record(PartitionId::new(0), Offset::ZERO, &entry(&[("event_type", "X")]));

        assert!(record.payload.is_empty());
    }
}
