use sepa_proto::{Gid, Notification, Sid};
use thiserror::Error;
use tokio::sync::mpsc;

/// Delivery capability held for each subscriber.
///
/// `notify` must return immediately: implementations enqueue and let the
/// gateway drain on its own task, so a slow wire never stalls a barrier.
pub trait EventSink: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<(), SinkError>;
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("connection closed")]
    ConnectionClosed,
}

/// Stock sink over an unbounded channel. The gateway holds the receiving end
/// and pumps frames onto the wire (or a test drains it directly).
pub struct ChannelSink(mpsc::UnboundedSender<Notification>);

impl ChannelSink {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

impl EventSink for ChannelSink {
    fn notify(&self, notification: Notification) -> Result<(), SinkError> {
        self.0.send(notification).map_err(|_| SinkError::ConnectionClosed)
    }
}

/// Dependability collaborator: the gateway-side component that tracks
/// connection health. The manager reports ordinary unsubscriptions and
/// detected-dead sinks through it; `kill_subscription` deliberately bypasses
/// the `unsubscribed` callback.
pub trait DependabilityMonitor: Send + Sync {
    fn unsubscribed(&self, _sid: &Sid, _gid: &Gid) {}

    fn connection_lost(&self, _gid: &Gid) {}
}

/// No-op implementation for deployments without a dependability layer
impl DependabilityMonitor for () {}
