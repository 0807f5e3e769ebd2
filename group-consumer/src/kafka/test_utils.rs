//! Test utilities for the consumer runtime: an in-memory record source, and
//! a committer and a handler that record what they see.
//! Used in "mod tests" and the tests/ directory.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{CommitError, SourceError};
use crate::event::{EventEnvelope, Message};
use crate::kafka::record::{discard_removed, group_into_batches, Record};
use crate::kafka::source::{
    MessageHandler, OffsetCommitter, PollOutcome, RebalanceListener, RecordSource,
};
use crate::kafka::types::{Partition, TopicPartitions};

pub fn envelope_payload(envelope: &EventEnvelope) -> Vec<u8> {
    serde_json::to_vec(envelope).expect("envelope serializes")
}

/// A record carrying a fresh `product_created` envelope
pub fn test_record(partition: &Partition, offset: i64) -> Record {
    Record::new(
        partition.clone(),
        offset,
        Some(format!("key-{offset}").into_bytes()),
        Some(envelope_payload(&EventEnvelope::new("product_created"))),
    )
}

pub fn test_records(partition: &Partition, offsets: impl IntoIterator<Item = i64>) -> Vec<Record> {
    offsets
        .into_iter()
        .map(|o| test_record(partition, o))
        .collect()
}

/// Polls `condition` until it holds, panics after five seconds
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Handler recording every invocation, in dispatch order.
#[derive(Default)]
pub struct RecordingHandler {
    started: Mutex<Vec<(Partition, i64)>>,
    completed: AtomicUsize,
    fail_offsets: HashSet<i64>,
    delay: Option<Duration>,
    gate: Option<CancellationToken>,
}

impl RecordingHandler {
    /// Every invocation sleeps for `delay` before returning
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Invocations for these offsets return an error
    pub fn failing_on(offsets: impl IntoIterator<Item = i64>) -> Self {
        Self {
            fail_offsets: offsets.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Invocations block until [`RecordingHandler::release`] is called
    pub fn gated() -> Self {
        Self {
            gate: Some(CancellationToken::new()),
            ..Default::default()
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.cancel();
        }
    }

    pub fn messages(&self) -> Vec<(Partition, i64)> {
        self.started.lock().unwrap().clone()
    }

    pub fn offsets_for(&self, partition: &Partition) -> Vec<i64> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == partition)
            .map(|(_, o)| *o)
            .collect()
    }

    pub fn started(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub async fn wait_started(&self, count: usize) {
        wait_until("handler invocations", || self.started() >= count).await
    }

    pub async fn wait_completed(&self, count: usize) {
        wait_until("handler completions", || self.completed() >= count).await
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, _cancel: CancellationToken, message: Message) -> anyhow::Result<()> {
        self.started
            .lock()
            .unwrap()
            .push((message.partition.clone(), message.offset));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(gate) = &self.gate {
            gate.cancelled().await;
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        if self.fail_offsets.contains(&message.offset) {
            anyhow::bail!("handler rejected offset {}", message.offset);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitCall {
    pub partitions: Vec<Partition>,
    pub offsets: Vec<i64>,
}

/// Committer recording every commit call.
#[derive(Default)]
pub struct RecordingCommitter {
    calls: Mutex<Vec<CommitCall>>,
    attempts: AtomicUsize,
    failing: AtomicBool,
    observed: Option<Arc<RecordingHandler>>,
    completed_at_commit: Mutex<Vec<usize>>,
}

impl RecordingCommitter {
    /// Also remembers how many invocations of `handler` had completed at
    /// each commit.
    pub fn observing(handler: Arc<RecordingHandler>) -> Self {
        Self {
            observed: Some(handler),
            ..Default::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Offsets of every successful commit, in commit order
    pub fn commits(&self) -> Vec<Vec<i64>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.offsets.clone())
            .collect()
    }

    pub fn commits_for(&self, partition: &Partition) -> Vec<Vec<i64>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.partitions.contains(partition))
            .map(|c| c.offsets.clone())
            .collect()
    }

    pub fn completed_before_first_commit(&self) -> Option<usize> {
        self.completed_at_commit.lock().unwrap().first().copied()
    }

    pub async fn wait_commits(&self, count: usize) {
        wait_until("commits", || self.calls.lock().unwrap().len() >= count).await
    }
}

impl OffsetCommitter for RecordingCommitter {
    fn commit(&self, records: &[Record]) -> Result<(), CommitError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CommitError::ClientGone);
        }

        if let Some(handler) = &self.observed {
            self.completed_at_commit
                .lock()
                .unwrap()
                .push(handler.completed());
        }

        let mut partitions: Vec<Partition> = Vec::new();
        for record in records {
            if !partitions.contains(record.partition()) {
                partitions.push(record.partition().clone());
            }
        }
        self.calls.lock().unwrap().push(CommitCall {
            partitions,
            offsets: records.iter().map(Record::offset).collect(),
        });
        Ok(())
    }
}

/// One scripted step of a [`MockRecordSource`].
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Assign(TopicPartitions),
    Revoke(TopicPartitions),
    Lost(TopicPartitions),
    /// Records returned by one poll, grouped into batches by the source
    Fetch(Vec<Record>),
    /// Records fetched by the current poll, which goes on with the next event.
    /// A later rebalance in the same poll discards those of the partitions it
    /// removes and ends the poll.
    Buffer(Vec<Record>),
    Close,
}

/// In-memory record source replaying a script.
///
/// Rebalance events are delivered to the bound listener from inside
/// `poll_batches`, like the kafka client does. Once the script is exhausted,
/// polls wait `idle_wait` and return nothing until more events are pushed.
pub struct MockRecordSource {
    script: Mutex<VecDeque<SourceEvent>>,
    listener: OnceLock<Arc<dyn RebalanceListener>>,
    batch_ids: AtomicU64,
    closed: AtomicBool,
    awaiting_allow: AtomicBool,
    polls: AtomicUsize,
    allow_calls: AtomicUsize,
    violations: AtomicUsize,
    discarded: AtomicUsize,
    idle_wait: Duration,
}

impl Default for MockRecordSource {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MockRecordSource {
    pub fn new(script: impl IntoIterator<Item = SourceEvent>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            listener: OnceLock::new(),
            batch_ids: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            awaiting_allow: AtomicBool::new(false),
            polls: AtomicUsize::new(0),
            allow_calls: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
            idle_wait: Duration::from_millis(5),
        }
    }

    /// Returns false if a listener was already bound
    pub fn bind(&self, listener: Arc<dyn RebalanceListener>) -> bool {
        self.listener.set(listener).is_ok()
    }

    pub fn push(&self, event: SourceEvent) {
        self.script.lock().unwrap().push_back(event);
    }

    pub fn is_drained(&self) -> bool {
        self.script.lock().unwrap().is_empty()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn allow_rebalance_calls(&self) -> usize {
        self.allow_calls.load(Ordering::SeqCst)
    }

    /// Polls started before the batches of the previous poll were released
    /// with `allow_rebalance`
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    /// Buffered records dropped because a rebalance of the same poll removed
    /// their partition
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }

    fn batches_of(&self, records: Vec<Record>) -> PollOutcome {
        let batches = group_into_batches(records, &self.batch_ids);
        if !batches.is_empty() {
            self.awaiting_allow.store(true, Ordering::SeqCst);
        }
        PollOutcome {
            batches,
            closed: false,
        }
    }

    fn discard_buffered(&self, buffered: &mut Vec<Record>, removed: &TopicPartitions) {
        let dropped = discard_removed(buffered, removed);
        self.discarded.fetch_add(dropped, Ordering::SeqCst);
    }

    pub async fn wait_drained(&self) {
        wait_until("script to be consumed", || self.is_drained()).await
    }
}

impl RecordSource for MockRecordSource {
    fn poll_batches(&self, max_records: usize) -> Result<PollOutcome, SourceError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.awaiting_allow.load(Ordering::SeqCst) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        let listener = self.listener.get().ok_or(SourceError::NotSubscribed)?;

        let mut buffered: Vec<Record> = Vec::new();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(PollOutcome::closed());
            }

            // never hold the script lock while a listener callback runs
            let next = self.script.lock().unwrap().pop_front();
            match next {
                None if buffered.is_empty() => {
                    std::thread::sleep(self.idle_wait);
                    return Ok(PollOutcome::default());
                }
                None => return Ok(self.batches_of(buffered)),
                Some(SourceEvent::Assign(tps)) => {
                    listener.on_assigned(&tps);
                    if !buffered.is_empty() {
                        return Ok(self.batches_of(buffered));
                    }
                }
                Some(SourceEvent::Revoke(tps)) => {
                    listener.on_revoked(&tps);
                    if !buffered.is_empty() {
                        self.discard_buffered(&mut buffered, &tps);
                        return Ok(self.batches_of(buffered));
                    }
                }
                Some(SourceEvent::Lost(tps)) => {
                    listener.on_lost(&tps);
                    if !buffered.is_empty() {
                        self.discard_buffered(&mut buffered, &tps);
                        return Ok(self.batches_of(buffered));
                    }
                }
                Some(SourceEvent::Buffer(records)) => buffered.extend(records),
                Some(SourceEvent::Fetch(mut records)) => {
                    let room = max_records.saturating_sub(buffered.len());
                    if records.len() > room {
                        let rest = records.split_off(room);
                        self.script
                            .lock()
                            .unwrap()
                            .push_front(SourceEvent::Fetch(rest));
                    }
                    buffered.extend(records);
                    return Ok(self.batches_of(buffered));
                }
                Some(SourceEvent::Close) => {
                    self.closed.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn allow_rebalance(&self) {
        self.allow_calls.fetch_add(1, Ordering::SeqCst);
        self.awaiting_allow.store(false, Ordering::SeqCst);
    }
}
