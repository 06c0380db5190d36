use crate::error::RequestError;
use tokio::sync::watch;

/// Observable state of a completion handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState<T> {
    Pending,
    Resolved(T),
    Rejected(RequestError),
}
impl<T> RequestState<T> {
    pub fn is_pending(&self) -> bool { matches!(self, RequestState::Pending) }
}

/// Settling side of a completion handle. Only the first settlement has an effect.
#[derive(Debug)]
pub struct Completer<T> {
    tx: watch::Sender<RequestState<T>>,
}
impl<T> Completer<T> {
    pub fn pair() -> (Completer<T>, CompletionHandle<T>) {
        let (tx, rx) = watch::channel(RequestState::Pending);
        (Completer { tx }, CompletionHandle { rx })
    }

    /// Another handle observing the same settlement.
    pub fn handle(&self) -> CompletionHandle<T> { CompletionHandle { rx: self.tx.subscribe() } }

    pub fn is_settled(&self) -> bool { !self.tx.borrow().is_pending() }

    /// Returns `false` if the handle had already been settled.
    pub fn settle(&self, result: Result<T, RequestError>) -> bool {
        self.tx.send_if_modified(move |state| {
            if !state.is_pending() {
                return false;
            }
            *state = match result {
                Ok(value) => RequestState::Resolved(value),
                Err(err) => RequestState::Rejected(err),
            };
            true
        })
    }
    pub fn resolve(&self, value: T) -> bool { self.settle(Ok(value)) }
    pub fn reject(&self, err: RequestError) -> bool { self.settle(Err(err)) }
}

/// Caller side of a request: can be polled through [`CompletionHandle::state`] or awaited.
#[derive(Debug, Clone)]
pub struct CompletionHandle<T> {
    rx: watch::Receiver<RequestState<T>>,
}
impl<T: Clone> CompletionHandle<T> {
    /// A handle that is already resolved with `value`
    pub fn resolved(value: T) -> Self {
        let (_, rx) = watch::channel(RequestState::Resolved(value));
        CompletionHandle { rx }
    }

    pub fn state(&self) -> RequestState<T> { self.rx.borrow().clone() }
    pub fn is_settled(&self) -> bool { !self.rx.borrow().is_pending() }

    /// Waits for settlement. Fails with [`RequestError::Abandoned`] if the settling side is dropped
    /// while the handle is still pending.
    pub async fn wait(mut self) -> Result<T, RequestError> {
        let settled = self.rx.wait_for(|s| !s.is_pending()).await.map(|s| s.clone());
        let state = match settled {
            Ok(state) => state,
            Err(_) => self.rx.borrow().clone(),
        };
        match state {
            RequestState::Resolved(value) => Ok(value),
            RequestState::Rejected(err) => Err(err),
            RequestState::Pending => Err(RequestError::Abandoned),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_settlement_wins() {
        let (completer, handle) = Completer::pair();
        let other = completer.handle();
        assert_eq!(handle.state(), RequestState::Pending);

        assert!(completer.resolve(3));
        assert!(!completer.reject(RequestError::cancelled("late")));

        assert_eq!(handle.wait().await, Ok(3));
        assert_eq!(other.state(), RequestState::Resolved(3));
    }

    #[tokio::test]
    async fn dropped_completer_abandons_handle() {
        let (completer, handle) = Completer::<u8>::pair();
        drop(completer);
        assert_eq!(handle.wait().await, Err(RequestError::Abandoned));
    }

    #[tokio::test]
    async fn settled_value_survives_completer_drop() {
        let (completer, handle) = Completer::<u32>::pair();
        completer.reject(RequestError::cancelled("gone"));
        drop(completer);
        assert_eq!(handle.wait().await, Err(RequestError::cancelled("gone")));
        assert_eq!(CompletionHandle::resolved(1).wait().await, Ok(1));
    }
}
