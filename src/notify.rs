//! Application-facing notification surface.
//!
//! The notifier is a capability composed into the gear, not a base class:
//! the connection machinery stays testable without any event plumbing. Each
//! named channel fans out to any number of observers over unbounded
//! channels; a slow consumer never blocks the broker event loop.
//!
//! The 0→1 observer transition is reported to the caller of [`Notifier::listen`]
//! because it is a real trigger: the gear subscribes to the platform's
//! presence topics only once somebody is listening for them.

use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Named notification channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Connected,
    Disconnected,
    Closed,
    Message,
    Present,
    Absent,
    Info,
    Error,
    Warning,
    Rejected,
}

/// A single notification delivered to observers
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Connected,
    Disconnected,
    Closed,
    /// Ordinary application message, carrying the full original topic
    Message { topic: String, payload: Bytes },
    /// A gear came online; JSON payload when parseable, raw text otherwise
    Present(Value),
    /// A gear went offline; JSON payload when parseable, raw text otherwise
    Absent(Value),
    Info(String),
    Error(String),
    Warning(String),
    Rejected(String),
}

impl Notification {
    /// The channel this notification is delivered on
    pub fn channel(&self) -> Channel {
        match self {
            Notification::Connected => Channel::Connected,
            Notification::Disconnected => Channel::Disconnected,
            Notification::Closed => Channel::Closed,
            Notification::Message { .. } => Channel::Message,
            Notification::Present(_) => Channel::Present,
            Notification::Absent(_) => Channel::Absent,
            Notification::Info(_) => Channel::Info,
            Notification::Error(_) => Channel::Error,
            Notification::Warning(_) => Channel::Warning,
            Notification::Rejected(_) => Channel::Rejected,
        }
    }
}

/// Observer registry for the named notification channels
#[derive(Debug, Default)]
pub struct Notifier {
    observers: Mutex<HashMap<Channel, Vec<mpsc::UnboundedSender<Notification>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for `channel`.
    ///
    /// The returned flag is true when this registration is the channel's
    /// 0→1 observer transition (dropped receivers are pruned first, so a
    /// re-registration after all observers went away counts as first again).
    pub fn listen(&self, channel: Channel) -> (mpsc::UnboundedReceiver<Notification>, bool) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut observers = self.observers.lock().expect("notifier lock poisoned");
        let senders = observers.entry(channel).or_default();
        senders.retain(|sender| !sender.is_closed());
        let first = senders.is_empty();
        senders.push(tx);
        (rx, first)
    }

    /// Deliver a notification to every live observer of its channel.
    pub fn notify(&self, notification: Notification) {
        let channel = notification.channel();
        let mut observers = self.observers.lock().expect("notifier lock poisoned");
        if let Some(senders) = observers.get_mut(&channel) {
            senders.retain(|sender| sender.send(notification.clone()).is_ok());
        }
    }

    /// Whether `channel` currently has at least one live observer.
    pub fn has_observers(&self, channel: Channel) -> bool {
        let mut observers = self.observers.lock().expect("notifier lock poisoned");
        match observers.get_mut(&channel) {
            Some(senders) => {
                senders.retain(|sender| !sender.is_closed());
                !senders.is_empty()
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_listener_flag_on_zero_to_one() {
        let notifier = Notifier::new();
        let (rx1, first1) = notifier.listen(Channel::Present);
        let (_rx2, first2) = notifier.listen(Channel::Present);

        assert!(first1);
        assert!(!first2);

        // dropping every observer makes the next registration first again
        drop(rx1);
        drop(_rx2);
        let (_rx3, first3) = notifier.listen(Channel::Present);
        assert!(first3);
    }

    #[test]
    fn test_channels_are_independent() {
        let notifier = Notifier::new();
        let (_rx, _) = notifier.listen(Channel::Present);
        let (_, first_absent) = notifier.listen(Channel::Absent);
        assert!(first_absent);
    }

    #[tokio::test]
    async fn test_notify_reaches_all_observers() {
        let notifier = Notifier::new();
        let (mut rx1, _) = notifier.listen(Channel::Info);
        let (mut rx2, _) = notifier.listen(Channel::Info);

        notifier.notify(Notification::Info("endpoint reset".to_string()));

        assert_eq!(
            rx1.recv().await,
            Some(Notification::Info("endpoint reset".to_string()))
        );
        assert_eq!(
            rx2.recv().await,
            Some(Notification::Info("endpoint reset".to_string()))
        );
    }

    #[tokio::test]
    async fn test_notify_routes_by_channel() {
        let notifier = Notifier::new();
        let (mut present_rx, _) = notifier.listen(Channel::Present);
        let (mut error_rx, _) = notifier.listen(Channel::Error);

        notifier.notify(Notification::Present(json!({"status": "here"})));

        assert_eq!(
            present_rx.recv().await,
            Some(Notification::Present(json!({"status": "here"})))
        );
        assert!(error_rx.try_recv().is_err());
    }

    #[test]
    fn test_has_observers_prunes_dropped() {
        let notifier = Notifier::new();
        let (rx, _) = notifier.listen(Channel::Absent);
        assert!(notifier.has_observers(Channel::Absent));

        drop(rx);
        assert!(!notifier.has_observers(Channel::Absent));
    }

    #[test]
    fn test_notify_without_observers_is_noop() {
        let notifier = Notifier::new();
        notifier.notify(Notification::Connected);
    }
}
