use std::sync::atomic::{AtomicU64, Ordering};

use rdkafka::message::{BorrowedMessage, Message as _};

use crate::error::DecodeError;
use crate::event::{EventEnvelope, Message};
use crate::kafka::types::{Partition, TopicPartitions};

/// An owned copy of one fetched log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    partition: Partition,
    offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Broker or producer timestamp in unix millis, when the record has one
    pub timestamp_ms: Option<i64>,
}

impl Record {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            payload,
            timestamp_ms: None,
        }
    }

    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        Self {
            partition: Partition::new(msg.topic(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(<[u8]>::to_vec),
            payload: msg.payload().map(<[u8]>::to_vec),
            timestamp_ms: msg.timestamp().to_millis(),
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Key as text; non UTF-8 bytes are replaced, a missing key is empty.
    pub fn key_string(&self) -> String {
        self.key
            .as_deref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default()
    }

    /// Decode the payload into the message handed to handlers
    pub fn to_message(&self) -> Result<Message, DecodeError> {
        let value = EventEnvelope::from_payload(self.payload.as_deref())?;
        Ok(Message {
            key: self.key_string(),
            value,
            partition: self.partition.clone(),
            offset: self.offset,
        })
    }
}

/// The records of one partition from one poll, in fetch order.
#[derive(Debug, Clone)]
pub struct PartitionBatch {
    pub partition: Partition,
    pub records: Vec<Record>,
    /// Sequential id assigned by the source, for ordering diagnostics
    pub batch_id: u64,
}

impl PartitionBatch {
    pub fn new(partition: Partition, records: Vec<Record>, batch_id: u64) -> Self {
        Self {
            partition,
            records,
            batch_id,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.records.first().map(Record::offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.records.last().map(Record::offset)
    }

    /// Returns None if the batch is empty
    pub fn max_offset(&self) -> Option<i64> {
        self.records.iter().map(Record::offset).max()
    }
}

/// Split the records of one poll into one batch per partition. Partitions
/// keep the order in which they first appeared, records keep fetch order.
/// Each batch takes the next id from `batch_ids`.
pub fn group_into_batches(records: Vec<Record>, batch_ids: &AtomicU64) -> Vec<PartitionBatch> {
    let mut batches: Vec<PartitionBatch> = Vec::new();
    for record in records {
        match batches
            .iter_mut()
            .find(|b| &b.partition == record.partition())
        {
            Some(batch) => batch.records.push(record),
            None => {
                let batch_id = batch_ids.fetch_add(1, Ordering::SeqCst);
                batches.push(PartitionBatch::new(
                    record.partition().clone(),
                    vec![record],
                    batch_id,
                ));
            }
        }
    }
    batches
}

/// Drop the records of partitions in `removed`, keeping the order of the
/// rest. Returns how many were dropped.
pub fn discard_removed(records: &mut Vec<Record>, removed: &TopicPartitions) -> usize {
    if removed.is_empty() {
        return 0;
    }
    let before = records.len();
    records.retain(|r| !removed.contains(r.partition()));
    before - records.len()
}
