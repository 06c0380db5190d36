//! Fan-out of shared fetches to independently cancellable subscriptions.
//!
//! Every key maps to at most one underlying [`RequestQueue`] request. Each `add_request` call gets its
//! own completion handle; when the underlying request settles, the result is broadcast to exactly
//! the subscriptions registered at that moment. Subscriptions carry the generation of the
//! underlying request they joined, so a request started for a key right after an earlier one for
//! the same key finished never receives the earlier result twice or loses its own.

use super::{Completer, CompletionHandle, RequestOptions, RequestQueue};
use crate::error::{QueueError, RequestError, DEFAULT_CANCEL_REASON};
use fxhash::{FxHashMap, FxHashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type SubscriberId = u64;

struct Subscription<T> {
    subscriber: SubscriberId,
    generation: u64,
    completer: Completer<T>,
}

struct SubscriptionState<T> {
    next_subscriber: SubscriberId,
    next_generation: u64,
    subscribers: FxHashSet<SubscriberId>,
    /// generation of the underlying request currently registered per key
    generations: FxHashMap<String, u64>,
    subscriptions: FxHashMap<String, Vec<Subscription<T>>>,
}

pub struct SubscribableRequestQueue<T> {
    queue: RequestQueue<T>,
    inner: Arc<Mutex<SubscriptionState<T>>>,
}
impl<T> Clone for SubscribableRequestQueue<T> {
    fn clone(&self) -> Self {
        SubscribableRequestQueue {
            queue: self.queue.clone(),
            inner: self.inner.clone(),
        }
    }
}
impl<T: Clone + Send + Sync + 'static> Default for SubscribableRequestQueue<T> {
    fn default() -> Self { Self::from_queue(RequestQueue::default()) }
}

impl<T: Clone + Send + Sync + 'static> SubscribableRequestQueue<T> {
    pub fn new(max_active_requests: usize, max_low_priority_requests: usize) -> Self {
        Self::from_queue(RequestQueue::new(max_active_requests, max_low_priority_requests))
    }

    fn from_queue(queue: RequestQueue<T>) -> Self {
        SubscribableRequestQueue {
            queue,
            inner: Arc::new(Mutex::new(SubscriptionState {
                next_subscriber: 0,
                next_generation: 0,
                subscribers: FxHashSet::default(),
                generations: FxHashMap::default(),
                subscriptions: FxHashMap::default(),
            })),
        }
    }

    /// Returns a fresh subscriber id. Ids are never reused.
    pub fn add_subscriber(&self) -> SubscriberId {
        let mut state = self.state();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(id);
        id
    }

    pub fn add_request<F, Fut>(&self, key: impl Into<String>, subscriber: SubscriberId, action: F) -> Result<CompletionHandle<T>, QueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.add_request_with(key, subscriber, RequestOptions::default(), action)
    }

    /// Subscribes to `key`, starting `action` only if no request for `key` is registered yet.
    pub fn add_request_with<F, Fut>(
        &self,
        key: impl Into<String>,
        subscriber: SubscriberId,
        options: RequestOptions,
        action: F,
    ) -> Result<CompletionHandle<T>, QueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let key = key.into();
        let mut state = self.state();
        if !state.subscribers.contains(&subscriber) {
            return Err(QueueError::UnknownSubscriber { id: subscriber });
        }

        let joined = state
            .generations
            .get(&key)
            .copied()
            .filter(|_| self.queue.has_request(&key));
        let generation = match joined {
            Some(generation) => {
                if !options.low_priority {
                    self.queue.promote(&key);
                }
                generation
            }
            None => {
                let generation = state.next_generation;
                state.next_generation += 1;
                state.generations.insert(key.clone(), generation);

                let underlying = self.queue.add_request_with(key.clone(), options, action);
                let inner = self.inner.clone();
                let watched_key = key.clone();
                tokio::spawn(async move {
                    let result = underlying.wait().await;
                    Self::broadcast(&inner, &watched_key, generation, result);
                });
                generation
            }
        };

        let (completer, handle) = Completer::pair();
        state.subscriptions.entry(key).or_default().push(Subscription {
            subscriber,
            generation,
            completer,
        });
        Ok(handle)
    }

    /// Rejects this subscriber's handles for `key`. The underlying request is cancelled only when no
    /// subscription for `key` remains and it has not started running; a running request always
    /// finishes. Returns `false` if the subscriber was not subscribed to `key`.
    pub fn cancel_request(&self, key: &str, subscriber: SubscriberId, reason: Option<&str>) -> bool {
        let mut state = self.state();
        self.cancel_locked(&mut state, key, subscriber, reason.unwrap_or(DEFAULT_CANCEL_REASON))
    }

    /// Cancels every remaining subscription of the subscriber and forgets its id.
    pub fn remove_subscriber(&self, subscriber: SubscriberId, reason: Option<&str>) {
        let mut state = self.state();
        if !state.subscribers.remove(&subscriber) {
            return;
        }
        let keys: Vec<String> = state
            .subscriptions
            .iter()
            .filter(|(_, subs)| subs.iter().any(|s| s.subscriber == subscriber))
            .map(|(k, _)| k.clone())
            .collect();
        let reason = reason.unwrap_or(DEFAULT_CANCEL_REASON);
        for key in keys {
            self.cancel_locked(&mut state, &key, subscriber, reason);
        }
        log::debug!("removed subscriber {subscriber}");
    }

    pub fn has_request(&self, key: &str) -> bool { self.queue.has_request(key) }
    pub fn request_running(&self, key: &str) -> bool { self.queue.request_running(key) }
    pub fn has_subscriber(&self, subscriber: SubscriberId) -> bool { self.state().subscribers.contains(&subscriber) }
    pub fn is_subscribed(&self, subscriber: SubscriberId, key: &str) -> bool {
        self.state()
            .subscriptions
            .get(key)
            .is_some_and(|subs| subs.iter().any(|s| s.subscriber == subscriber))
    }
    /// Keys the subscriber currently holds subscriptions for
    pub fn subscribed_keys(&self, subscriber: SubscriberId) -> Vec<String> {
        self.state()
            .subscriptions
            .iter()
            .filter(|(_, subs)| subs.iter().any(|s| s.subscriber == subscriber))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, SubscriptionState<T>> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    fn cancel_locked(&self, state: &mut SubscriptionState<T>, key: &str, subscriber: SubscriberId, reason: &str) -> bool {
        let Some(subs) = state.subscriptions.get_mut(key) else {
            return false;
        };
        let (cancelled, remaining): (Vec<_>, Vec<_>) = subs.drain(..).partition(|s| s.subscriber == subscriber);
        *subs = remaining;
        if cancelled.is_empty() {
            return false;
        }
        for sub in cancelled {
            sub.completer.reject(RequestError::cancelled(reason));
        }

        // subscriptions of an earlier, already finished request may still await their broadcast
        let current = state.generations.get(key).copied();
        let live = subs.iter().any(|s| Some(s.generation) == current);
        if subs.is_empty() {
            state.subscriptions.remove(key);
        }
        if !live && !self.queue.request_running(key) && self.queue.cancel_request(key, Some(reason)) {
            state.generations.remove(key);
            log::debug!("cancelled shared request {key}, no subscribers left");
        }
        true
    }

    fn broadcast(inner: &Mutex<SubscriptionState<T>>, key: &str, generation: u64, result: Result<T, RequestError>) {
        let mut state = inner.lock().unwrap_or_else(PoisonError::into_inner);
        if state.generations.get(key) == Some(&generation) {
            state.generations.remove(key);
        }
        let Some(subs) = state.subscriptions.get_mut(key) else {
            return;
        };
        let (settled, remaining): (Vec<_>, Vec<_>) = subs.drain(..).partition(|s| s.generation == generation);
        *subs = remaining;
        if subs.is_empty() {
            state.subscriptions.remove(key);
        }
        log::debug!("settling {} subscriptions for {key}", settled.len());
        for sub in settled {
            sub.completer.settle(result.clone());
        }
    }
}
