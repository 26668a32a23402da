use tokio::sync::mpsc;

use crate::models::ServerEvent;

/// Snapshot of a turn's answer so far. `text` always carries the full
/// accumulated answer, never a delta, so dropped or re-sent deliveries leave
/// the client with a usable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub text: String,
    pub partial: bool,
    pub complete: bool,
}

impl Notification {
    pub fn partial(text: String) -> Self {
        Self {
            text,
            partial: true,
            complete: false,
        }
    }

    pub fn complete(text: String) -> Self {
        Self {
            text,
            partial: false,
            complete: true,
        }
    }
}

impl From<Notification> for ServerEvent {
    fn from(notification: Notification) -> Self {
        ServerEvent::Stream {
            text: notification.text,
            partial: notification.partial,
            complete: notification.complete,
        }
    }
}

/// Transport-agnostic delivery target for turn notifications.
pub trait NotifySink: Send + Sync {
    /// Delivery is best-effort: a sink whose client is gone must swallow the
    /// notification rather than fail the turn.
    fn notify(&self, notification: Notification);
}

/// Production sink feeding a connection's outbound event channel.
pub struct ChannelSink {
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl ChannelSink {
    pub fn new(events: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self { events }
    }
}

impl NotifySink for ChannelSink {
    fn notify(&self, notification: Notification) {
        // The receiver disappears when the client disconnects mid-stream.
        let _ = self.events.send(notification.into());
    }
}

#[cfg(test)]
pub struct CollectingSink {
    events: std::sync::Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl CollectingSink {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().expect("sink lock").clone()
    }
}

#[cfg(test)]
impl NotifySink for CollectingSink {
    fn notify(&self, notification: Notification) {
        self.events.lock().expect("sink lock").push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelSink, Notification, NotifySink};
    use crate::models::ServerEvent;
    use tokio::sync::mpsc;

    #[test]
    fn channel_sink_forwards_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
        let sink = ChannelSink::new(tx);

        sink.notify(Notification::partial("He".to_string()));
        sink.notify(Notification::complete("Hello".to_string()));

        let first = rx.try_recv().expect("first event");
        assert_eq!(
            first,
            ServerEvent::Stream {
                text: "He".to_string(),
                partial: true,
                complete: false,
            }
        );
        let second = rx.try_recv().expect("second event");
        assert_eq!(
            second,
            ServerEvent::Stream {
                text: "Hello".to_string(),
                partial: false,
                complete: true,
            }
        );
    }

    #[test]
    fn channel_sink_swallows_delivery_to_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel::<ServerEvent>();
        drop(rx);
        let sink = ChannelSink::new(tx);
        // Must not panic or error — the client is simply gone.
        sink.notify(Notification::complete("Hello".to_string()));
    }
}
