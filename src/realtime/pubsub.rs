//! Typed publish/subscribe with disposer handles

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registry<K, E> {
    next_id: u64,
    topics: HashMap<K, Vec<(SubscriptionId, Handler<E>)>>,
}

/// Handlers grouped by topic key.
///
/// Publishing snapshots the handler list first, so handlers may subscribe or
/// unsubscribe (including themselves) while being invoked.
pub struct Topics<K, E> {
    inner: Arc<Mutex<Registry<K, E>>>,
}

impl<K, E> Clone for Topics<K, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, E> Default for Topics<K, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    E: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, E> Topics<K, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    E: 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                topics: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<K, E>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe<F>(&self, key: K, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.lock();
            registry.next_id += 1;
            let id = SubscriptionId(registry.next_id);
            registry
                .topics
                .entry(key.clone())
                .or_default()
                .push((id, Arc::new(handler)));
            id
        };

        let weak: Weak<Mutex<Registry<K, E>>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Topics { inner }.unsubscribe(&key, id);
                }
            })),
        }
    }

    /// Remove exactly one registration. Unknown ids are a no-op.
    pub fn unsubscribe(&self, key: &K, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let Some(handlers) = registry.topics.get_mut(key) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            registry.topics.remove(key);
        }
        removed
    }

    pub fn has_subscribers(&self, key: &K) -> bool {
        self.lock().topics.contains_key(key)
    }

    pub fn subscriber_count(&self, key: &K) -> usize {
        self.lock().topics.get(key).map_or(0, Vec::len)
    }

    /// Invoke every handler of `key` in registration order.
    pub fn publish(&self, key: &K, event: &E) -> usize {
        let handlers: Vec<Handler<E>> = match self.lock().topics.get(key) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }
}

/// Disposer for one registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: SubscriptionId,
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    /// Run `f` right after the registration is removed by this handle.
    pub(crate) fn on_release<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        if let Some(remove) = self.remove.take() {
            self.remove = Some(Box::new(move || {
                remove();
                f();
            }));
        }
        self
    }

    /// Keep the registration alive past this handle; remove it later by id.
    pub fn detach(mut self) -> SubscriptionId {
        self.remove = None;
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
