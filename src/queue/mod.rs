//! Bounded-concurrency fetch queue keyed by request key.
//!
//! At most one action exists per key. Actions run in one of two lanes: the normal lane, limited to
//! `max_active_requests`, and a low-priority lane for prefetching, limited separately by
//! `max_low_priority_requests`. Queue bookkeeping never suspends; only the actions themselves do.
//!
//! Actions are spawned on the ambient Tokio runtime, so requests must be added from within one.

mod handle;
mod subscribable;

pub use handle::{Completer, CompletionHandle, RequestState};
pub use subscribable::{SubscribableRequestQueue, SubscriberId};

use crate::error::{RequestError, DEFAULT_CANCEL_REASON};
use futures::future::BoxFuture;
use futures::FutureExt;
use fxhash::FxHashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const DEFAULT_MAX_ACTIVE_REQUESTS: usize = 10;
pub const DEFAULT_MAX_LOW_PRIORITY_REQUESTS: usize = 5;

type RequestAction<T> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub low_priority: bool,
    /// Time to wait before the request enters its lane. Not a deadline.
    pub delay: Option<Duration>,
}
impl RequestOptions {
    pub fn low_priority() -> Self {
        RequestOptions {
            low_priority: true,
            delay: None,
        }
    }
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Normal,
    LowPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Delayed,
    Queued,
    Running(Lane),
}

struct Request<T> {
    id: u64,
    lane: Lane,
    status: Status,
    action: Option<RequestAction<T>>,
    completer: Completer<T>,
}

struct QueueState<T> {
    max_active: usize,
    max_low_priority: usize,
    requests: FxHashMap<String, Request<T>>,
    normal: VecDeque<String>,
    low: VecDeque<String>,
    active: usize,
    active_low: usize,
    next_id: u64,
}
impl<T> QueueState<T> {
    fn lane_queue(&mut self, lane: Lane) -> &mut VecDeque<String> {
        match lane {
            Lane::Normal => &mut self.normal,
            Lane::LowPriority => &mut self.low,
        }
    }

    fn remove_queued(&mut self, key: &str) -> Option<Request<T>> {
        if matches!(self.requests.get(key)?.status, Status::Running(_)) {
            return None;
        }
        let request = self.requests.remove(key)?;
        self.lane_queue(request.lane).retain(|k| k != key);
        Some(request)
    }
}

pub struct RequestQueue<T> {
    inner: Arc<Mutex<QueueState<T>>>,
}
impl<T> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        RequestQueue {
            inner: self.inner.clone(),
        }
    }
}
impl<T: Clone + Send + Sync + 'static> Default for RequestQueue<T> {
    fn default() -> Self { Self::new(DEFAULT_MAX_ACTIVE_REQUESTS, DEFAULT_MAX_LOW_PRIORITY_REQUESTS) }
}

impl<T: Clone + Send + Sync + 'static> RequestQueue<T> {
    pub fn new(max_active_requests: usize, max_low_priority_requests: usize) -> Self {
        RequestQueue {
            inner: Arc::new(Mutex::new(QueueState {
                max_active: max_active_requests,
                max_low_priority: max_low_priority_requests,
                requests: FxHashMap::default(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
                active: 0,
                active_low: 0,
                next_id: 0,
            })),
        }
    }

    pub fn add_request<F, Fut>(&self, key: impl Into<String>, action: F) -> CompletionHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.add_request_with(key, RequestOptions::default(), action)
    }

    /// Starts `action` under `key`, or joins the request already registered for `key`, in which
    /// case `action` is dropped unused. Joining with normal priority promotes a low-priority request
    /// that has not started yet.
    pub fn add_request_with<F, Fut>(&self, key: impl Into<String>, options: RequestOptions, action: F) -> CompletionHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let key = key.into();
        let mut state = self.state();

        if let Some(handle) = Self::join(&mut state, &key, options.low_priority) {
            self.pump(&mut state);
            return handle;
        }

        let lane = if options.low_priority {
            Lane::LowPriority
        } else {
            Lane::Normal
        };
        let delay = options.delay.filter(|d| !d.is_zero());
        let id = state.next_id;
        state.next_id += 1;
        let (completer, handle) = Completer::pair();
        let action: RequestAction<T> = Box::new(move || action().boxed());
        state.requests.insert(
            key.clone(),
            Request {
                id,
                lane,
                status: if delay.is_some() { Status::Delayed } else { Status::Queued },
                action: Some(action),
                completer,
            },
        );

        match delay {
            Some(delay) => {
                log::debug!("delaying request {key} by {delay:?}");
                let queue = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.enqueue_delayed(&key, id);
                });
            }
            None => {
                state.lane_queue(lane).push_back(key);
                self.pump(&mut state);
            }
        }
        handle
    }

    /// Cancels a request that has not started running yet, rejecting its handles with `reason`.
    /// Returns `false` if there is no such request or it is already running.
    pub fn cancel_request(&self, key: &str, reason: Option<&str>) -> bool {
        let mut state = self.state();
        match state.remove_queued(key) {
            Some(request) => {
                log::debug!("cancelled request {key}");
                request
                    .completer
                    .reject(RequestError::cancelled(reason.unwrap_or(DEFAULT_CANCEL_REASON)));
                true
            }
            None => false,
        }
    }

    /// Cancels every request that has not started yet. Returns the number of cancelled requests.
    pub fn cancel_all_requests(&self, reason: Option<&str>) -> usize {
        let mut state = self.state();
        let keys: Vec<String> = state
            .requests
            .iter()
            .filter(|(_, r)| !matches!(r.status, Status::Running(_)))
            .map(|(k, _)| k.clone())
            .collect();
        let reason = reason.unwrap_or(DEFAULT_CANCEL_REASON);
        for key in &keys {
            if let Some(request) = state.remove_queued(key) {
                request.completer.reject(RequestError::cancelled(reason));
            }
        }
        keys.len()
    }

    /// Moves a low-priority request that has not started yet into the normal lane.
    pub fn promote(&self, key: &str) -> bool {
        let mut state = self.state();
        let promoted = Self::promote_locked(&mut state, key);
        if promoted {
            self.pump(&mut state);
        }
        promoted
    }

    pub fn has_request(&self, key: &str) -> bool { self.state().requests.contains_key(key) }
    pub fn request_running(&self, key: &str) -> bool {
        self.state()
            .requests
            .get(key)
            .is_some_and(|r| matches!(r.status, Status::Running(_)))
    }
    /// Number of running actions across both lanes
    pub fn active_count(&self) -> usize {
        let state = self.state();
        state.active + state.active_low
    }
    /// Number of requests waiting for a slot, including delayed ones
    pub fn queued_count(&self) -> usize {
        let state = self.state();
        state.requests.len() - state.active - state.active_low
    }

    fn state(&self) -> MutexGuard<'_, QueueState<T>> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    fn join(state: &mut QueueState<T>, key: &str, low_priority: bool) -> Option<CompletionHandle<T>> {
        let handle = state.requests.get(key)?.completer.handle();
        if !low_priority {
            Self::promote_locked(state, key);
        }
        Some(handle)
    }

    fn promote_locked(state: &mut QueueState<T>, key: &str) -> bool {
        let Some(request) = state.requests.get_mut(key) else {
            return false;
        };
        if request.lane != Lane::LowPriority || matches!(request.status, Status::Running(_)) {
            return false;
        }
        request.lane = Lane::Normal;
        if request.status == Status::Queued {
            log::debug!("promoting request {key}");
            state.low.retain(|k| k != key);
            state.normal.push_back(key.to_string());
        }
        true
    }

    fn enqueue_delayed(&self, key: &str, id: u64) {
        let mut state = self.state();
        let lane = match state.requests.get_mut(key) {
            Some(request) if request.id == id && request.status == Status::Delayed => {
                request.status = Status::Queued;
                request.lane
            }
            _ => return,
        };
        state.lane_queue(lane).push_back(key.to_string());
        self.pump(&mut state);
    }

    /// Starts queued requests while their lane has free slots.
    fn pump(&self, state: &mut QueueState<T>) {
        while state.active < state.max_active {
            let Some(key) = state.normal.pop_front() else {
                break;
            };
            self.start(state, key, Lane::Normal);
        }
        while state.active_low < state.max_low_priority {
            let Some(key) = state.low.pop_front() else {
                break;
            };
            self.start(state, key, Lane::LowPriority);
        }
    }

    fn start(&self, state: &mut QueueState<T>, key: String, lane: Lane) {
        let Some(request) = state.requests.get_mut(&key) else {
            return;
        };
        let Some(action) = request.action.take() else {
            return;
        };
        request.status = Status::Running(lane);
        let id = request.id;
        match lane {
            Lane::Normal => state.active += 1,
            Lane::LowPriority => state.active_low += 1,
        }
        log::debug!("starting request {key} ({lane:?})");

        let queue = self.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(async move { action().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("request action panicked")));
            queue.finish(&key, id, result);
        });
    }

    fn finish(&self, key: &str, id: u64, result: anyhow::Result<T>) {
        let mut state = self.state();
        let Some(request) = state.requests.get(key) else {
            return;
        };
        let Status::Running(lane) = request.status else {
            return;
        };
        if request.id != id {
            return;
        }
        let Some(request) = state.requests.remove(key) else {
            return;
        };
        match lane {
            Lane::Normal => state.active -= 1,
            Lane::LowPriority => state.active_low -= 1,
        }
        match result {
            Ok(value) => {
                log::debug!("request {key} done");
                request.completer.resolve(value);
            }
            Err(err) => {
                log::warn!("request {key} failed: {err:#}");
                request.completer.reject(err.into());
            }
        }
        self.pump(&mut state);
    }
}
