use serde::{Deserialize, Serialize};

use crate::{bindings::BindingSet, id::SpuId};

/// An event pushed from an SPU to its subscribers.
///
/// Sequence numbers increase strictly and without gaps per SPU; every emitted
/// notification (snapshot, delta or termination) consumes one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub spuid: SpuId,
    pub sequence: u64,
    pub event: NotificationEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// The full result set, sent once to each newly attached subscriber.
    InitialSnapshot { bindings: BindingSet },
    /// Solutions that entered the result set in the last update.
    Added { bindings: BindingSet },
    /// Solutions that left the result set in the last update.
    Removed { bindings: BindingSet },
    /// The SPU is going away; no further notifications will follow.
    Terminated { reason: TerminationReason },
}

impl NotificationEvent {
    pub fn bindings(&self) -> Option<&BindingSet> {
        match self {
            Self::InitialSnapshot { bindings } | Self::Added { bindings } | Self::Removed { bindings } => Some(bindings),
            Self::Terminated { .. } => None,
        }
    }
}

impl Notification {
    pub fn is_terminal(&self) -> bool { matches!(self.event, NotificationEvent::Terminated { .. }) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Unsubscribed,
    ConnectionLost,
    Shutdown,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsubscribed => write!(f, "unsubscribed"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// The JSON frame the WebSocket gateway puts on the wire. Termination is
/// signalled out of band (the gateway closes the subscription), so it has no
/// frame form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFrame {
    pub spuid: SpuId,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_results: Option<BindingSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_results: Option<BindingSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed_results: Option<BindingSet>,
}

impl SubscriptionFrame {
    pub fn from_notification(notification: &Notification) -> Option<Self> {
        let mut frame =
            Self { spuid: notification.spuid, sequence: notification.sequence, first_results: None, added_results: None, removed_results: None };
        match &notification.event {
            NotificationEvent::InitialSnapshot { bindings } => frame.first_results = Some(bindings.clone()),
            NotificationEvent::Added { bindings } => frame.added_results = Some(bindings.clone()),
            NotificationEvent::Removed { bindings } => frame.removed_results = Some(bindings.clone()),
            NotificationEvent::Terminated { .. } => return None,
        }
        Some(frame)
    }
}
