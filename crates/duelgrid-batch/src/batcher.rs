//! The per-recipient batcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use duelgrid_protocol::{BattleMessage, ClientEvent, PlayerId, RoomId, SessionId, TimerSnapshot};

/// Where a flushed batch goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    /// One player session.
    Session {
        player_id: PlayerId,
        session_id: SessionId,
    },
    /// Everyone spectating a room. Fanned out per instance via the
    /// room's spectator channel.
    Spectators { room_id: RoomId },
}

impl Recipient {
    pub fn session(player_id: PlayerId, session_id: SessionId) -> Self {
        Self::Session {
            player_id,
            session_id,
        }
    }

    pub fn spectators(room_id: RoomId) -> Self {
        Self::Spectators { room_id }
    }

    fn key(&self) -> String {
        match self {
            Recipient::Session {
                player_id,
                session_id,
            } => format!("session:{player_id}:{session_id}"),
            Recipient::Spectators { room_id } => format!("room:{room_id}"),
        }
    }
}

/// Transport seam for flushed events.
pub trait BatchSink: Send + Sync + 'static {
    fn deliver(&self, recipient: &Recipient, event: ClientEvent)
        -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Flush as soon as a batch holds this many messages.
    pub max_batch_size: usize,
    /// Quiet period before a partial batch flushes.
    pub debounce: Duration,
    /// A batch older than this is flushed before accepting more,
    /// bounding latency under a constant trickle that keeps resetting
    /// the debounce.
    pub max_age: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 15,
            debounce: Duration::from_millis(25),
            max_age: Duration::from_secs(1),
        }
    }
}

struct Batch {
    recipient: Recipient,
    messages: Vec<BattleMessage>,
    /// Latest snapshot per player; only the newest reading matters.
    timer_snapshots: HashMap<PlayerId, TimerSnapshot>,
    created_at: Instant,
    debounce_timer: Option<JoinHandle<()>>,
}

impl Batch {
    fn new(recipient: Recipient) -> Self {
        Self {
            recipient,
            messages: Vec::new(),
            timer_snapshots: HashMap::new(),
            created_at: Instant::now(),
            debounce_timer: None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.debounce_timer.take() {
            timer.abort();
        }
    }
}

struct Inner<K> {
    config: BatcherConfig,
    sink: Arc<K>,
    batches: Mutex<HashMap<String, Batch>>,
}

/// Coalesces outbound events per recipient. Cheap to clone.
pub struct MessageBatcher<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for MessageBatcher<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: BatchSink> MessageBatcher<K> {
    pub fn new(sink: Arc<K>, config: BatcherConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                batches: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Queues a message for a recipient, flushing when a trigger fires.
    pub async fn add(&self, recipient: Recipient, message: BattleMessage) {
        let key = recipient.key();
        let immediate = message.kind.is_immediate();

        let flush_now = {
            let mut batches = self.inner.batches.lock().expect("batch map poisoned");
            let batch = batches
                .entry(key.clone())
                .or_insert_with(|| Batch::new(recipient));

            // An over-age batch flushes before absorbing more; the new
            // message starts (or joins) the next one after the flush
            // below picks everything up together, so just force it.
            let over_age = batch.created_at.elapsed() >= self.inner.config.max_age;
            if over_age {
                tracing::debug!(recipient = %key, "force-flushing over-age batch");
            }

            batch.messages.push(message);
            immediate || over_age || batch.messages.len() >= self.inner.config.max_batch_size
        };

        if flush_now {
            Inner::flush_key(&self.inner, &key).await;
        } else {
            self.arm_debounce(&key);
        }
    }

    /// Records a timer snapshot, replacing any pending one for the
    /// same player.
    pub fn add_timer_snapshot(&self, recipient: Recipient, snapshot: TimerSnapshot) {
        let key = recipient.key();
        {
            let mut batches = self.inner.batches.lock().expect("batch map poisoned");
            let batch = batches
                .entry(key.clone())
                .or_insert_with(|| Batch::new(recipient));
            batch
                .timer_snapshots
                .insert(snapshot.player_id.clone(), snapshot);
        }
        self.arm_debounce(&key);
    }

    /// Flushes everything pending for one session.
    pub async fn flush_session(&self, player_id: &PlayerId, session_id: &SessionId) {
        let key = Recipient::session(player_id.clone(), session_id.clone()).key();
        Inner::flush_key(&self.inner, &key).await;
    }

    /// Flushes every pending batch. Used during graceful shutdown.
    pub async fn flush_all(&self) {
        let keys: Vec<String> = {
            let batches = self.inner.batches.lock().expect("batch map poisoned");
            batches.keys().cloned().collect()
        };
        for key in keys {
            Inner::flush_key(&self.inner, &key).await;
        }
    }

    /// Drops anything pending for a recipient without delivering.
    /// Called on session teardown so timers do not leak.
    pub fn discard(&self, recipient: &Recipient) {
        let mut batches = self.inner.batches.lock().expect("batch map poisoned");
        if let Some(mut batch) = batches.remove(&recipient.key()) {
            batch.cancel_timer();
        }
    }

    /// Number of recipients with something pending.
    pub fn pending_recipients(&self) -> usize {
        self.inner.batches.lock().expect("batch map poisoned").len()
    }

    fn arm_debounce(&self, key: &str) {
        let mut batches = self.inner.batches.lock().expect("batch map poisoned");
        let Some(batch) = batches.get_mut(key) else {
            return;
        };
        batch.cancel_timer();
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        let deadline = Instant::now() + self.inner.config.debounce;
        batch.debounce_timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            Inner::flush_key(&inner, &key).await;
        }));
    }
}

impl<K: BatchSink> Inner<K> {
    async fn flush_key(inner: &Arc<Self>, key: &str) {
        let (recipient, messages, snapshots) = {
            let mut batches = inner.batches.lock().expect("batch map poisoned");
            let Some(mut batch) = batches.remove(key) else {
                return;
            };
            batch.cancel_timer();
            let mut snapshots: Vec<TimerSnapshot> =
                batch.timer_snapshots.into_values().collect();
            snapshots.sort_by(|a, b| a.player_id.cmp(&b.player_id));
            (batch.recipient, batch.messages, snapshots)
        };

        if !messages.is_empty() {
            let event = if messages.len() == 1 {
                let mut messages = messages;
                ClientEvent::BattleEvent {
                    message: messages.remove(0),
                }
            } else {
                ClientEvent::BattleEventBatch { messages }
            };
            inner.sink.deliver(&recipient, event).await;
        }
        if !snapshots.is_empty() {
            inner
                .sink
                .deliver(&recipient, ClientEvent::TimerSnapshot { snapshots })
                .await;
        }
    }
}
