//! Per-resource watcher registry and fan-out.
//!
//! # Purpose
//! Both backends publish change events through a [`WatcherHub`]: a map of
//! active watchers keyed by UUID. Fan-out takes a read lock only long
//! enough to snapshot the entries, then delivers outside the lock so a slow
//! consumer never stalls registration. Senders await on a watcher's bounded
//! channel (backpressure); a dropped consumer is pruned on the next
//! broadcast.
//!
//! # Ownership
//! The hub's map is the only strong owner of a watcher entry. A
//! [`WatchStream`] holds a weak back-reference used solely to unregister
//! itself when stopped or dropped.

use futures::Stream;
use osprey_kube::selector::SelectionPredicate;
use osprey_kube::{Event, KubeObject};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use uuid::Uuid;

struct WatcherEntry<O> {
    tx: mpsc::Sender<Event<O>>,
    /// Namespace scope captured at watch time; empty means all namespaces.
    namespace: Option<String>,
    predicate: SelectionPredicate<O>,
}

impl<O: KubeObject> WatcherEntry<O> {
    /// Delivers the event if it passes this watcher's filter. `force` skips
    /// filtering for initial snapshot replay. Returns `false` once the
    /// consumer is gone.
    async fn offer(&self, event: &Event<O>, force: bool) -> bool {
        if !force {
            if !self.predicate.matches(&event.object) {
                return true;
            }
            if let Some(ns) = self.namespace.as_deref() {
                if !ns.is_empty() && event.object.namespace() != ns {
                    return true;
                }
            }
        }
        self.tx.send(event.clone()).await.is_ok()
    }
}

struct HubInner<O> {
    kind: String,
    watchers: RwLock<HashMap<Uuid, Arc<WatcherEntry<O>>>>,
}

impl<O> HubInner<O> {
    fn remove(&self, id: &Uuid) {
        let removed = self
            .watchers
            .write()
            .expect("watchers lock")
            .remove(id)
            .is_some();
        if removed {
            metrics::gauge!("osprey_watchers", "kind" => self.kind.clone()).decrement(1.0);
        }
    }
}

/// Registry of the active watchers for one resource kind.
pub struct WatcherHub<O> {
    inner: Arc<HubInner<O>>,
}

impl<O> Clone for WatcherHub<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O: KubeObject> WatcherHub<O> {
    pub fn new(kind: &str) -> Self {
        Self {
            inner: Arc::new(HubInner {
                kind: kind.to_string(),
                watchers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Creates an unregistered watcher. The caller enqueues the initial
    /// snapshot through the returned handle and only then registers it, so
    /// a live event can never precede the snapshot item for the same key.
    pub fn subscribe(
        &self,
        namespace: Option<String>,
        predicate: SelectionPredicate<O>,
        buffer: usize,
    ) -> (PendingWatcher<O>, WatchStream<O>) {
        let (tx, rx) = mpsc::channel(buffer);
        let id = Uuid::new_v4();
        let entry = Arc::new(WatcherEntry {
            tx,
            namespace,
            predicate,
        });
        let pending = PendingWatcher {
            id,
            entry,
            hub: self.clone(),
        };
        let stream = WatchStream {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        };
        (pending, stream)
    }

    /// Delivers one event to every eligible watcher, pruning watchers whose
    /// consumer went away.
    pub async fn broadcast(&self, event: Event<O>) {
        let entries: Vec<(Uuid, Arc<WatcherEntry<O>>)> = {
            let watchers = self.inner.watchers.read().expect("watchers lock");
            watchers
                .iter()
                .map(|(id, entry)| (*id, Arc::clone(entry)))
                .collect()
        };
        tracing::debug!(
            kind = %self.inner.kind,
            event = ?event.event_type,
            object = %event.object.name(),
            watchers = entries.len(),
            "fan-out"
        );
        let mut dead = Vec::new();
        for (id, entry) in &entries {
            if !entry.offer(&event, false).await {
                dead.push(*id);
            }
        }
        for id in dead {
            self.inner.remove(&id);
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.read().expect("watchers lock").len()
    }

    /// Drops every watcher; their streams end.
    pub fn clear(&self) {
        self.inner.watchers.write().expect("watchers lock").clear();
    }
}

/// A watcher that has a channel but is not yet part of the fan-out map.
pub struct PendingWatcher<O> {
    id: Uuid,
    entry: Arc<WatcherEntry<O>>,
    hub: WatcherHub<O>,
}

impl<O: KubeObject> PendingWatcher<O> {
    /// Enqueues a snapshot event, bypassing the filter (the list that
    /// produced the snapshot already applied it). Returns `false` when the
    /// consumer is gone.
    pub async fn replay(&self, event: Event<O>) -> bool {
        self.entry.offer(&event, true).await
    }

    /// Joins the fan-out map; live events flow from here on.
    pub fn register(self) {
        let mut watchers = self.hub.inner.watchers.write().expect("watchers lock");
        watchers.insert(self.id, self.entry);
        metrics::gauge!("osprey_watchers", "kind" => self.hub.inner.kind.clone()).increment(1.0);
    }
}

/// Consumer half of a watch: the initial snapshot as `Added` events, then
/// live changes. Dropping the stream unregisters the watcher.
pub struct WatchStream<O> {
    id: Uuid,
    rx: mpsc::Receiver<Event<O>>,
    hub: Weak<HubInner<O>>,
}

impl<O> WatchStream<O> {
    pub async fn recv(&mut self) -> Option<Event<O>> {
        self.rx.recv().await
    }

    /// Removes the watcher from the fan-out map; buffered events remain
    /// readable, no new ones arrive.
    pub fn stop(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(&self.id);
        }
    }
}

impl<O> Drop for WatchStream<O> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<O> Stream for WatchStream<O> {
    type Item = Event<O>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
