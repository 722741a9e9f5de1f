use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use tiller_types::{Event, EventSource};

use crate::file_store::FileStore;
use crate::storage_paths::{cursor_key, event_id_from_key, event_key, events_prefix};

/// Subscriber callbacks are async and fallible. A failing callback keeps its
/// cursor in place so the event is redelivered; subscribers must therefore be
/// idempotent keyed by event id.
pub type SubscriberCallback =
    Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

const DELIVERY_RETRY_BASE: Duration = Duration::from_millis(100);
const DELIVERY_RETRY_CAP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Cursor {
    last_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub source: Option<EventSource>,
    pub kind: Option<String>,
    pub actions_only: bool,
    pub observations_only: bool,
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        if let Some(source) = self.source {
            if event.source != source {
                return false;
            }
        }
        if let Some(kind) = self.kind.as_deref() {
            if event.kind() != kind {
                return false;
            }
        }
        if self.actions_only && !event.is_action() {
            return false;
        }
        if self.observations_only && event.is_action() {
            return false;
        }
        true
    }
}

enum SubscriberMsg {
    Deliver(Event),
    Rewind(u64),
    Shutdown,
}

struct Subscriber {
    tx: mpsc::UnboundedSender<SubscriberMsg>,
    task: JoinHandle<()>,
}

struct Inner {
    next_id: u64,
    events: Vec<Event>,
}

/// Append-only, ordered, durable event log for one session.
///
/// Appends are serialized and write through to the backing store before any
/// subscriber sees the event; ids are dense and never reused. Each subscriber
/// gets its own delivery task so a slow callback delays only that subscriber.
pub struct EventStream {
    session_id: String,
    store: Arc<dyn FileStore>,
    inner: Mutex<Inner>,
    subscribers: Mutex<HashMap<String, Subscriber>>,
}

impl EventStream {
    pub fn new(session_id: impl Into<String>, store: Arc<dyn FileStore>) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            store,
            inner: Mutex::new(Inner {
                next_id: 0,
                events: Vec::new(),
            }),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    /// Rebuild a stream from its persisted events. The tail id resumes after
    /// the highest stored event, so restarted sessions keep ids dense.
    pub async fn load(
        session_id: impl Into<String>,
        store: Arc<dyn FileStore>,
    ) -> anyhow::Result<Arc<Self>> {
        let session_id = session_id.into();
        let keys = store.list(&events_prefix(&session_id)).await?;
        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(id) = event_id_from_key(&key) else {
                continue;
            };
            let Some(bytes) = store.get(&key).await? else {
                continue;
            };
            let event: Event = serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt event at `{key}`"))?;
            anyhow::ensure!(event.id == id, "event id mismatch at `{key}`");
            events.push(event);
        }
        events.sort_by_key(|event| event.id);
        for (offset, event) in events.iter().enumerate() {
            anyhow::ensure!(
                event.id == offset as u64,
                "gap in persisted events for session `{session_id}` at id {}",
                event.id
            );
        }
        let next_id = events.len() as u64;
        Ok(Arc::new(Self {
            session_id,
            store,
            inner: Mutex::new(Inner { next_id, events }),
            subscribers: Mutex::new(HashMap::new()),
        }))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append one event: assign the next dense id, stamp the timestamp, write
    /// through to the store, then fan out. On a storage failure the id is not
    /// consumed and no subscriber sees the event.
    pub async fn append(&self, mut event: Event) -> anyhow::Result<u64> {
        let stamped = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_id;
            if let Some(cause) = event.cause {
                anyhow::ensure!(
                    cause < id,
                    "event cause {cause} must point at an earlier event (next id {id})"
                );
            }
            event.id = id;
            event.timestamp = Utc::now();
            let bytes = serde_json::to_vec(&event)?;
            self.store
                .put(&event_key(&self.session_id, id), &bytes)
                .await
                .with_context(|| format!("persist event {id} for session `{}`", self.session_id))?;
            inner.next_id = id + 1;
            inner.events.push(event.clone());
            event
        };

        let subscribers = self.subscribers.lock().await;
        for subscriber in subscribers.values() {
            let _ = subscriber.tx.send(SubscriberMsg::Deliver(stamped.clone()));
        }
        Ok(stamped.id)
    }

    pub async fn get_event(&self, id: u64) -> Option<Event> {
        self.inner.lock().await.events.get(id as usize).cloned()
    }

    /// Ordered range scan. A pure function of the current log contents, so
    /// callers can restart it at any position.
    pub async fn get_events(
        &self,
        start_id: u64,
        end_id: Option<u64>,
        filter: Option<&EventFilter>,
    ) -> Vec<Event> {
        let inner = self.inner.lock().await;
        let end = end_id
            .map(|end| end.min(inner.next_id))
            .unwrap_or(inner.next_id);
        if start_id >= end {
            return Vec::new();
        }
        inner.events[start_id as usize..end as usize]
            .iter()
            .filter(|event| filter.map(|f| f.matches(event)).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn tail_id(&self) -> Option<u64> {
        let inner = self.inner.lock().await;
        inner.next_id.checked_sub(1)
    }

    /// Register (or replace) a named subscriber. A name with a recorded
    /// cursor (a replaced subscription, or one surviving a restart) resumes
    /// from that cursor; a fresh name starts at `start_id`, defaulting to the
    /// current tail + 1.
    pub async fn subscribe(
        self: &Arc<Self>,
        name: &str,
        callback: SubscriberCallback,
        start_id: Option<u64>,
    ) {
        // Resolve the start position before taking the subscriber lock;
        // append acquires inner-then-subscribers and this path must not
        // invert that order.
        let resumed = self.durable_cursor(name).await.map(|last| last + 1);
        let default_start = self.inner.lock().await.next_id;
        let position = match resumed {
            Some(position) => position,
            None => start_id.unwrap_or(default_start),
        };

        let mut subscribers = self.subscribers.lock().await;
        if let Some(existing) = subscribers.remove(name) {
            let _ = existing.tx.send(SubscriberMsg::Shutdown);
            existing.task.abort();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(deliver_loop(
            Arc::clone(self),
            name.to_string(),
            callback,
            position,
            rx,
        ));
        subscribers.insert(name.to_string(), Subscriber { tx, task });
    }

    pub async fn unsubscribe(&self, name: &str) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(subscriber) = subscribers.remove(name) {
            let _ = subscriber.tx.send(SubscriberMsg::Shutdown);
            subscriber.task.abort();
        }
    }

    /// Move the named subscriber's cursor backward and redeliver from there.
    pub async fn replay(&self, name: &str, from_id: u64) {
        let subscribers = self.subscribers.lock().await;
        if let Some(subscriber) = subscribers.get(name) {
            let _ = subscriber.tx.send(SubscriberMsg::Rewind(from_id));
        }
    }

    pub async fn close(&self) {
        let mut subscribers = self.subscribers.lock().await;
        for (_, subscriber) in subscribers.drain() {
            let _ = subscriber.tx.send(SubscriberMsg::Shutdown);
            subscriber.task.abort();
        }
    }

    async fn durable_cursor(&self, name: &str) -> Option<u64> {
        let bytes = self
            .store
            .get(&cursor_key(&self.session_id, name))
            .await
            .ok()??;
        let cursor: Cursor = serde_json::from_slice(&bytes).ok()?;
        u64::try_from(cursor.last_id).ok()
    }

    async fn persist_cursor(&self, name: &str, last_id: u64) {
        let cursor = Cursor {
            last_id: last_id as i64,
        };
        let Ok(bytes) = serde_json::to_vec(&cursor) else {
            return;
        };
        // Cursors only need to be eventually durable; a failed write means a
        // wider replay window after restart, not lost events.
        if let Err(err) = self
            .store
            .put(&cursor_key(&self.session_id, name), &bytes)
            .await
        {
            tracing::warn!(
                session_id = %self.session_id,
                subscriber = name,
                error = %err,
                "cursor write failed"
            );
        }
    }
}

async fn deliver_loop(
    stream: Arc<EventStream>,
    name: String,
    callback: SubscriberCallback,
    mut next: u64,
    mut rx: mpsc::UnboundedReceiver<SubscriberMsg>,
) {
    loop {
        // Catch up from the log first so replayed and missed events arrive
        // in append order before anything queued on the channel.
        loop {
            let batch = stream.get_events(next, None, None).await;
            if batch.is_empty() {
                break;
            }
            for event in batch {
                let id = event.id;
                deliver_one(&stream, &name, &callback, event).await;
                next = id + 1;
            }
        }

        match rx.recv().await {
            Some(SubscriberMsg::Deliver(event)) => {
                if event.id < next {
                    continue;
                }
                if event.id > next {
                    // Gap relative to our cursor; re-read from the log.
                    continue;
                }
                let id = event.id;
                deliver_one(&stream, &name, &callback, event).await;
                next = id + 1;
            }
            Some(SubscriberMsg::Rewind(from)) => {
                next = from;
            }
            Some(SubscriberMsg::Shutdown) | None => break,
        }
    }
}

async fn deliver_one(
    stream: &Arc<EventStream>,
    name: &str,
    callback: &SubscriberCallback,
    event: Event,
) {
    let mut failures = 0u32;
    loop {
        match callback(event.clone()).await {
            Ok(()) => {
                stream.persist_cursor(name, event.id).await;
                return;
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(
                    session_id = %stream.session_id(),
                    subscriber = name,
                    event_id = event.id,
                    failures,
                    error = %err,
                    "subscriber callback failed; will redeliver"
                );
                let wait = DELIVERY_RETRY_BASE.saturating_mul(1 << failures.min(6));
                tokio::time::sleep(wait.min(DELIVERY_RETRY_CAP)).await;
            }
        }
    }
}
