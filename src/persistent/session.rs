// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The Persistent Subscription Engine (component F): one task per
//! `(stream, group)` owning the read cursor, checkpoint, in-flight map, and
//! connected consumers, driven by `GroupMessage` (§4.F).

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::append::commit_bus::{CommitBus, CommitSubscription};
use crate::append::AppendCoordinator;
use crate::error::{ChronicleResult, DropReason, InputError};
use crate::event::EventRecord;
use crate::ids::{EventId, EventNumber, StreamId, StreamTail};
use crate::metrics::StoreMetrics;
use crate::read::Reader;
use crate::subscription::{try_deliver, SubscriptionEvent};

use super::checkpoint::CheckpointStore;
use super::group::{DispatchStrategy, PersistentSubscriptionKey, PersistentSubscriptionSettings, StartFrom};

/// Disposition requested by a session's `nack` call (§4.F "Delivery
/// tracking").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackAction {
    Retry,
    Park,
    Skip,
    Stop,
}

enum GroupMessage {
    Connect {
        consumer_id: u64,
        sender: mpsc::Sender<SubscriptionEvent>,
    },
    Disconnect {
        consumer_id: u64,
    },
    Ack {
        consumer_id: u64,
        event_ids: Vec<EventId>,
    },
    Nack {
        consumer_id: u64,
        event_ids: Vec<EventId>,
        action: NackAction,
    },
    Shutdown,
}

struct InFlight {
    record: EventRecord,
    consumer_id: u64,
    deadline: Instant,
}

struct Consumer {
    id: u64,
    sender: mpsc::Sender<SubscriptionEvent>,
    in_flight_count: usize,
}

/// A connected consumer's handle to a persistent subscription group.
/// Disconnects automatically when dropped.
pub struct PersistentSession {
    consumer_id: u64,
    pub events: mpsc::Receiver<SubscriptionEvent>,
    control: mpsc::UnboundedSender<GroupMessage>,
}

impl PersistentSession {
    pub fn ack(&self, event_ids: Vec<EventId>) {
        let _ = self.control.send(GroupMessage::Ack {
            consumer_id: self.consumer_id,
            event_ids,
        });
    }

    pub fn nack(&self, event_ids: Vec<EventId>, action: NackAction) {
        let _ = self.control.send(GroupMessage::Nack {
            consumer_id: self.consumer_id,
            event_ids,
            action,
        });
    }
}

impl Drop for PersistentSession {
    fn drop(&mut self) {
        let _ = self.control.send(GroupMessage::Disconnect {
            consumer_id: self.consumer_id,
        });
    }
}

struct GroupHandle {
    control: mpsc::UnboundedSender<GroupMessage>,
    task: tokio::task::JoinHandle<()>,
}

/// Owns every `(stream, group)` persistent subscription in the process.
/// Failures in one group's task never affect another's (§7 propagation
/// policy).
pub struct PersistentSubscriptionEngine {
    reader: Arc<Reader>,
    commit_bus: Arc<CommitBus>,
    coordinator: Arc<AppendCoordinator>,
    metrics: Arc<StoreMetrics>,
    groups: DashMap<PersistentSubscriptionKey, GroupHandle>,
    next_consumer_id: AtomicU64,
}

impl PersistentSubscriptionEngine {
    pub fn new(reader: Arc<Reader>, commit_bus: Arc<CommitBus>, coordinator: Arc<AppendCoordinator>, metrics: Arc<StoreMetrics>) -> Self {
        Self {
            reader,
            commit_bus,
            coordinator,
            metrics,
            groups: DashMap::new(),
            next_consumer_id: AtomicU64::new(0),
        }
    }

    pub fn create(&self, stream_id: StreamId, group_name: impl Into<String>, settings: PersistentSubscriptionSettings) -> ChronicleResult<()> {
        let key = PersistentSubscriptionKey::new(stream_id, group_name);
        if self.groups.contains_key(&key) {
            return Err(InputError::BadRequest(format!("persistent subscription {key} already exists")).into());
        }
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let checkpoints = CheckpointStore::new(self.coordinator.clone(), self.reader.clone());
        let task = tokio::spawn(run_group(
            key.clone(),
            settings,
            self.reader.clone(),
            self.commit_bus.clone(),
            checkpoints,
            self.metrics.clone(),
            control_rx,
        ));
        self.groups.insert(key, GroupHandle { control: control_tx, task });
        Ok(())
    }

    /// Restarts the group under new settings. The checkpoint stream is
    /// untouched, so the new instance resumes exactly where the old one
    /// left off rather than replaying from `settings.start_from`.
    pub fn update(&self, stream_id: StreamId, group_name: impl Into<String>, settings: PersistentSubscriptionSettings) -> ChronicleResult<()> {
        let group_name = group_name.into();
        self.delete(&stream_id, &group_name)?;
        self.create(stream_id, group_name, settings)
    }

    pub fn delete(&self, stream_id: &StreamId, group_name: &str) -> ChronicleResult<()> {
        let key = PersistentSubscriptionKey::new(stream_id.clone(), group_name);
        match self.groups.remove(&key) {
            Some((_, handle)) => {
                let _ = handle.control.send(GroupMessage::Shutdown);
                handle.task.abort();
                Ok(())
            }
            None => Err(InputError::NotFound.into()),
        }
    }

    pub fn connect(&self, stream_id: &StreamId, group_name: &str, buffer_size: usize) -> ChronicleResult<PersistentSession> {
        let key = PersistentSubscriptionKey::new(stream_id.clone(), group_name);
        let handle = self.groups.get(&key).ok_or(InputError::NotFound)?;
        let consumer_id = self.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        let _ = handle.control.send(GroupMessage::Connect { consumer_id, sender: tx });
        Ok(PersistentSession {
            consumer_id,
            events: rx,
            control: handle.control.clone(),
        })
    }
}

fn pick_consumer(strategy: DispatchStrategy, record: &EventRecord, consumers: &mut [Consumer], round_robin_cursor: &mut usize, read_batch_size: usize) -> Option<usize> {
    if consumers.is_empty() {
        return None;
    }
    let max_in_flight = read_batch_size.max(1);
    match strategy {
        DispatchStrategy::RoundRobin => {
            for step in 0..consumers.len() {
                let idx = (*round_robin_cursor + step) % consumers.len();
                if consumers[idx].in_flight_count < max_in_flight {
                    *round_robin_cursor = (idx + 1) % consumers.len();
                    return Some(idx);
                }
            }
            None
        }
        DispatchStrategy::DispatchToSingle => {
            if consumers[0].in_flight_count < max_in_flight {
                Some(0)
            } else {
                None
            }
        }
        DispatchStrategy::Pinned => {
            let key = correlation_key(record);
            let idx = (key % consumers.len() as u64) as usize;
            if consumers[idx].in_flight_count < max_in_flight {
                Some(idx)
            } else {
                None
            }
        }
    }
}

/// Per §4.F "Pinned": `event.correlation-id` if present, else `event-id`.
/// `Event` carries no dedicated correlation-id field, so this treats
/// `metadata` as a UTF-8 correlation key when set.
fn correlation_key(record: &EventRecord) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    if !record.event.metadata.is_empty() {
        if let Ok(s) = std::str::from_utf8(&record.event.metadata) {
            s.hash(&mut hasher);
            return hasher.finish();
        }
    }
    record.event.event_id.hash(&mut hasher);
    hasher.finish()
}

fn initial_cursor(reader: &Reader, stream_id: &StreamId, checkpoint: Option<EventNumber>, start_from: StartFrom) -> EventNumber {
    if let Some(checkpoint) = checkpoint {
        return checkpoint + 1;
    }
    match start_from {
        StartFrom::EventNumber(n) => n,
        StartFrom::Live => match reader.stream_tail(stream_id) {
            StreamTail::At(n) => n + 1,
            StreamTail::NoStream | StreamTail::Deleted => 0,
        },
    }
}

/// Mutable state owned by a single group's task, bundled so the message
/// handlers below can take it as one argument instead of seven.
struct GroupState {
    checkpoint_candidate: EventNumber,
    settled: BTreeSet<EventNumber>,
    retry_counts: HashMap<EventNumber, u32>,
    in_flight: HashMap<EventNumber, InFlight>,
    by_event_id: HashMap<EventId, EventNumber>,
    consumers: Vec<Consumer>,
    round_robin_cursor: usize,
    pending: VecDeque<EventRecord>,
    events_since_checkpoint: u64,
}

impl GroupState {
    fn settle(&mut self, n: EventNumber) {
        self.settled.insert(n);
        self.events_since_checkpoint += 1;
        self.retry_counts.remove(&n);
    }

    fn take_in_flight(&mut self, consumer_id: u64, event_id: EventId) -> Option<InFlight> {
        let n = self.by_event_id.remove(&event_id)?;
        let inflight = self.in_flight.remove(&n)?;
        if inflight.consumer_id != consumer_id {
            // Already redelivered to someone else (e.g. after a disconnect);
            // this ack/nack refers to a stale delivery.
            self.in_flight.insert(n, inflight);
            self.by_event_id.insert(event_id, n);
            return None;
        }
        if let Some(c) = self.consumers.iter_mut().find(|c| c.id == consumer_id) {
            c.in_flight_count = c.in_flight_count.saturating_sub(1);
        }
        Some(inflight)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_group(
    key: PersistentSubscriptionKey,
    settings: PersistentSubscriptionSettings,
    reader: Arc<Reader>,
    commit_bus: Arc<CommitBus>,
    checkpoints: CheckpointStore,
    metrics: Arc<StoreMetrics>,
    mut control: mpsc::UnboundedReceiver<GroupMessage>,
) {
    let stream_label = key.stream_id.as_str().to_string();
    let group_label = key.group_name.clone();

    let checkpointed = match checkpoints.load(&key.stream_id, &key.group_name) {
        Ok(c) => c,
        Err(e) => {
            warn!(stream = %stream_label, group = %group_label, error = %e, "failed to load checkpoint");
            None
        }
    };
    let mut cursor = initial_cursor(&reader, &key.stream_id, checkpointed, settings.start_from);

    let mut state = GroupState {
        checkpoint_candidate: checkpointed.unwrap_or(-1),
        settled: BTreeSet::new(),
        retry_counts: HashMap::new(),
        in_flight: HashMap::new(),
        by_event_id: HashMap::new(),
        consumers: Vec::new(),
        round_robin_cursor: 0,
        pending: VecDeque::new(),
        events_since_checkpoint: 0,
    };
    let mut live_sub: Option<CommitSubscription> = None;
    let mut last_checkpoint_at = Instant::now();
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    let mut stopped = false;

    'outer: loop {
        loop {
            match control.try_recv() {
                Ok(msg) => handle_control_message(msg, &checkpoints, &key, &settings, &metrics, &mut state, &mut stopped),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    stopped = true;
                    break;
                }
            }
        }

        if stopped {
            for consumer in &state.consumers {
                let _ = consumer.sender.try_send(SubscriptionEvent::Dropped(DropReason::PersistentSubscriptionDeleted));
            }
            break 'outer;
        }

        advance_checkpoint(&mut state.checkpoint_candidate, &mut state.settled);
        maybe_persist_checkpoint(&checkpoints, &key, &settings, &mut state.events_since_checkpoint, &mut last_checkpoint_at, state.checkpoint_candidate);
        for record in expire_deadlines(&mut state, &settings) {
            park_event(&checkpoints, &key, &metrics, &mut state, record);
        }
        metrics
            .persistent_inflight
            .with_label_values(&[&stream_label, &group_label])
            .set(state.in_flight.len() as i64);

        dispatch_pending(&reader, &metrics, &settings, &mut state);

        if !state.pending.is_empty() {
            // More to dispatch once a consumer frees up; avoid a tight
            // busy loop but keep checking state promptly.
            tokio::time::sleep(Duration::from_millis(5)).await;
            continue 'outer;
        }

        if live_sub.is_none() {
            fill_from_history(&reader, &commit_bus, &settings, &key, &mut cursor, &mut state, &mut live_sub, &stream_label, &group_label);
            continue 'outer;
        }

        let sub = live_sub.as_mut().expect("live_sub is Some on this path");
        tokio::select! {
            biased;
            msg = control.recv() => {
                if msg.is_none() {
                    stopped = true;
                }
                continue 'outer;
            }
            committed = sub.receiver.recv() => {
                if let Some(committed) = committed {
                    if committed.record.stream_id == key.stream_id && committed.record.event_number >= cursor {
                        cursor = committed.record.event_number + 1;
                        state.pending.push_back(committed.record);
                    }
                }
                continue 'outer;
            }
            _ = tick.tick() => {
                continue 'outer;
            }
        }
    }

    debug!(stream = %stream_label, group = %group_label, "persistent subscription group stopped");
}

fn handle_control_message(
    msg: GroupMessage,
    checkpoints: &CheckpointStore,
    key: &PersistentSubscriptionKey,
    settings: &PersistentSubscriptionSettings,
    metrics: &StoreMetrics,
    state: &mut GroupState,
    stopped: &mut bool,
) {
    match msg {
        GroupMessage::Connect { consumer_id, sender } => {
            state.consumers.push(Consumer { id: consumer_id, sender, in_flight_count: 0 });
        }
        GroupMessage::Disconnect { consumer_id } => {
            state.consumers.retain(|c| c.id != consumer_id);
            let stranded: Vec<EventNumber> = state
                .in_flight
                .iter()
                .filter(|(_, i)| i.consumer_id == consumer_id)
                .map(|(n, _)| *n)
                .collect();
            for n in stranded {
                if let Some(inflight) = state.in_flight.remove(&n) {
                    state.by_event_id.remove(&inflight.record.event.event_id);
                    state.pending.push_front(inflight.record);
                }
            }
        }
        GroupMessage::Ack { consumer_id, event_ids } => {
            for id in event_ids {
                if let Some(inflight) = state.take_in_flight(consumer_id, id) {
                    state.settle(inflight.record.event_number);
                }
            }
        }
        GroupMessage::Nack { consumer_id, event_ids, action } => {
            for id in event_ids {
                let Some(inflight) = state.take_in_flight(consumer_id, id) else { continue };
                let n = inflight.record.event_number;
                match action {
                    NackAction::Retry => {
                        let count = state.retry_counts.entry(n).or_insert(0);
                        *count += 1;
                        if *count >= settings.max_retries {
                            state.retry_counts.remove(&n);
                            park_event(checkpoints, key, metrics, state, inflight.record);
                        } else {
                            state.pending.push_front(inflight.record);
                        }
                    }
                    NackAction::Park => {
                        park_event(checkpoints, key, metrics, state, inflight.record);
                    }
                    NackAction::Skip => {
                        state.settle(n);
                    }
                    NackAction::Stop => {
                        *stopped = true;
                    }
                }
            }
        }
        GroupMessage::Shutdown => {
            *stopped = true;
        }
    }
}

fn park_event(checkpoints: &CheckpointStore, key: &PersistentSubscriptionKey, metrics: &StoreMetrics, state: &mut GroupState, record: EventRecord) {
    let n = record.event_number;
    if let Err(e) = checkpoints.park(&key.stream_id, &key.group_name, &record) {
        warn!(stream = %key.stream_id, group = %key.group_name, error = %e, "failed to park event");
    }
    metrics
        .persistent_parked_total
        .with_label_values(&[key.stream_id.as_str(), &key.group_name])
        .inc();
    state.settle(n);
}

fn dispatch_pending(reader: &Reader, metrics: &StoreMetrics, settings: &PersistentSubscriptionSettings, state: &mut GroupState) {
    while let Some(record) = state.pending.front() {
        let Some(idx) = pick_consumer(settings.named_consumer_strategy, record, &mut state.consumers, &mut state.round_robin_cursor, settings.read_batch_size) else {
            break;
        };
        let record = state.pending.pop_front().unwrap();
        let resolved = reader.resolve_record(record.clone(), settings.resolve_links);
        let consumer_id = state.consumers[idx].id;
        if try_deliver(&state.consumers[idx].sender, metrics, SubscriptionEvent::EventAppeared(resolved), DropReason::SubscriberMaxCountReached) {
            state.consumers[idx].in_flight_count += 1;
            state.by_event_id.insert(record.event.event_id, record.event_number);
            state.in_flight.insert(
                record.event_number,
                InFlight {
                    record,
                    consumer_id,
                    deadline: Instant::now() + settings.message_timeout,
                },
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn fill_from_history(
    reader: &Reader,
    commit_bus: &CommitBus,
    settings: &PersistentSubscriptionSettings,
    key: &PersistentSubscriptionKey,
    cursor: &mut EventNumber,
    state: &mut GroupState,
    live_sub: &mut Option<CommitSubscription>,
    stream_label: &str,
    group_label: &str,
) {
    let slice = match reader.read_stream_forward(&key.stream_id, *cursor, settings.read_batch_size.max(1), settings.resolve_links) {
        Ok(slice) => slice,
        Err(e) => {
            warn!(stream = %stream_label, group = %group_label, error = %e, "persistent subscription read failed");
            return;
        }
    };
    *cursor = slice.next_event_number;
    for event in slice.events {
        state.pending.push_back(event.event);
    }
    if !slice.is_end_of_stream {
        return;
    }

    let mut sub = commit_bus.subscribe();
    if let Ok(gap) = reader.read_stream_forward(&key.stream_id, *cursor, settings.read_batch_size.max(1) * 8, settings.resolve_links) {
        *cursor = gap.next_event_number;
        for event in gap.events {
            state.pending.push_back(event.event);
        }
    }
    loop {
        match sub.receiver.try_recv() {
            Ok(committed) if committed.record.stream_id == key.stream_id && committed.record.event_number >= *cursor => {
                if state.pending.len() >= settings.live_buffer_size {
                    warn!(stream = %stream_label, group = %group_label, "persistent subscription live buffer overflow");
                    break;
                }
                *cursor = committed.record.event_number + 1;
                state.pending.push_back(committed.record);
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    *live_sub = Some(sub);
}

/// Advances `checkpoint_candidate` while the next event number is settled,
/// per §4.F "Checkpointing" (contiguous prefix of acked-or-parked events).
fn advance_checkpoint(checkpoint_candidate: &mut EventNumber, settled: &mut BTreeSet<EventNumber>) {
    while settled.remove(&(*checkpoint_candidate + 1)) {
        *checkpoint_candidate += 1;
    }
}

fn maybe_persist_checkpoint(
    checkpoints: &CheckpointStore,
    key: &PersistentSubscriptionKey,
    settings: &PersistentSubscriptionSettings,
    events_since_checkpoint: &mut u64,
    last_checkpoint_at: &mut Instant,
    checkpoint_candidate: EventNumber,
) {
    if checkpoint_candidate < 0 {
        return;
    }
    let due_by_count = *events_since_checkpoint >= settings.min_checkpoint_count && last_checkpoint_at.elapsed() >= settings.checkpoint_after;
    let due_unconditionally = *events_since_checkpoint >= settings.max_checkpoint_count;
    if due_by_count || due_unconditionally {
        if let Err(e) = checkpoints.persist(&key.stream_id, &key.group_name, checkpoint_candidate) {
            warn!(stream = %key.stream_id, group = %key.group_name, error = %e, "failed to persist checkpoint");
            return;
        }
        *events_since_checkpoint = 0;
        *last_checkpoint_at = Instant::now();
    }
}

/// Treats every in-flight event past its deadline as an implicit
/// `nack(retry)` (§4.F "On timeout, treat as nack(retry)"), returning the
/// ones that have now reached `max_retries` retries so the caller can park
/// them.
fn expire_deadlines(state: &mut GroupState, settings: &PersistentSubscriptionSettings) -> Vec<EventRecord> {
    let now = Instant::now();
    let expired: Vec<EventNumber> = state
        .in_flight
        .iter()
        .filter(|(_, inflight)| inflight.deadline <= now)
        .map(|(n, _)| *n)
        .collect();
    let mut to_park = Vec::new();
    for n in expired {
        if let Some(inflight) = state.in_flight.remove(&n) {
            state.by_event_id.remove(&inflight.record.event.event_id);
            if let Some(c) = state.consumers.iter_mut().find(|c| c.id == inflight.consumer_id) {
                c.in_flight_count = c.in_flight_count.saturating_sub(1);
            }
            let count = state.retry_counts.entry(n).or_insert(0);
            *count += 1;
            if *count >= settings.max_retries {
                state.retry_counts.remove(&n);
                to_park.push(inflight.record);
            } else {
                state.pending.push_front(inflight.record);
            }
        }
    }
    to_park
}
