use crate::queue::SubscriberId;
use derive_more::{Display, Error};

pub const DEFAULT_CANCEL_REASON: &str = "request cancelled";

/// Reason a completion handle was rejected.
///
/// Cancellation and fetch failures travel through the same rejection path and are told apart by
/// the variant.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[display("cancelled: {reason}")]
    Cancelled { reason: String },
    #[display("request failed: {message}")]
    Failed { message: String },
    #[display("request was dropped before it settled")]
    Abandoned,
}
impl RequestError {
    pub fn cancelled(reason: impl Into<String>) -> Self { RequestError::Cancelled { reason: reason.into() } }
    pub fn is_cancellation(&self) -> bool { matches!(self, RequestError::Cancelled { .. }) }
}
impl From<anyhow::Error> for RequestError {
    fn from(err: anyhow::Error) -> Self {
        RequestError::Failed {
            message: format!("{err:#}"),
        }
    }
}

#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[display("unknown subscriber {id}")]
    UnknownSubscriber { id: SubscriberId },
}
