//! Broker session lifecycle.
//!
//! [`BrokerSession::run`] owns one connection attempt end to end: it derives
//! the transport credentials, drives the rumqttc event loop, applies the
//! saved subscription set on every reconnect, and demultiplexes inbound
//! traffic through the [`router`]. It returns to the orchestrator only when
//! the broker rejects the credentials (forcing a fresh token cycle) or a
//! shutdown is requested.

pub mod credentials;
pub mod router;

use crate::config::GearConfig;
use crate::error::GearResult;
use crate::identity::Identity;
use crate::notify::{Channel, Notification, Notifier};
use crate::token::{AccessToken, TokenManager};
use router::RoutedEvent;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Packet, QoS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Connection options supplied by the application
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectOptions {
    /// Last-will message, published by the broker if the session dies
    pub will: Option<LastWill>,
}

/// Last-will descriptor; the topic is rewritten into the application
/// namespace when the connection is initiated.
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Publish options
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PublishOptions {
    pub retain: bool,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionOutcome {
    /// The broker refused the current credentials; the cached tokens are
    /// stale and the full token cycle must restart.
    AuthRejected,
    /// Shutdown was requested through `disconnect`.
    Shutdown,
}

/// Live handle to a connected (or connecting) session
#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    pub client: AsyncClient,
    pub connected: watch::Receiver<bool>,
    pub generation: u64,
}

impl SessionHandle {
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

/// Append a topic to the subscription set unless already present.
pub(crate) fn record_subscription(subscriptions: &mut Vec<String>, topic: String) {
    if !subscriptions.contains(&topic) {
        subscriptions.push(topic);
    }
}

fn is_auth_rejection(code: ConnectReturnCode) -> bool {
    matches!(
        code,
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
    )
}

/// One broker connection attempt, tagged with a session generation so stale
/// handles can be told apart from the live one.
pub(crate) struct BrokerSession {
    pub identity: Identity,
    pub config: GearConfig,
    pub notifier: Arc<Notifier>,
    pub tokens: Arc<Mutex<TokenManager>>,
    pub subscriptions: Arc<Mutex<Vec<String>>>,
    pub generation: u64,
}

impl BrokerSession {
    /// Drive the session until shutdown or a fatal authentication error.
    pub async fn run(
        &self,
        access: AccessToken,
        options: &ConnectOptions,
        handle_slot: &Mutex<Option<SessionHandle>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> GearResult<SessionOutcome> {
        let now = chrono::Utc::now().timestamp();
        let mqtt_options =
            credentials::build_mqtt_options(&self.identity, &self.config, &access, options, now)?;

        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);
        let (connected_tx, connected_rx) = watch::channel(false);
        *handle_slot.lock().await = Some(SessionHandle {
            client: client.clone(),
            connected: connected_rx,
            generation: self.generation,
        });

        let outcome = self
            .drive_event_loop(&client, event_loop, &access, &connected_tx, &mut shutdown_rx)
            .await;

        // only the owning generation may clear the slot
        let mut slot = handle_slot.lock().await;
        if slot
            .as_ref()
            .is_some_and(|handle| handle.generation == self.generation)
        {
            *slot = None;
        }
        drop(slot);

        let _ = client.disconnect().await;
        self.notifier.notify(Notification::Closed);
        Ok(outcome)
    }

    async fn drive_event_loop(
        &self,
        client: &AsyncClient,
        mut event_loop: EventLoop,
        access: &AccessToken,
        connected_tx: &watch::Sender<bool>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> SessionOutcome {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(generation = self.generation, "session shutdown requested");
                        return SessionOutcome::Shutdown;
                    }
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        let was_connected = connected_tx.send_replace(true);
                        if !was_connected {
                            info!(generation = self.generation, "broker session established");
                        }
                        self.on_connected(client, access).await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.on_publish(&publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(ConnectionError::ConnectionRefused(code)) if is_auth_rejection(code) => {
                        connected_tx.send_replace(false);
                        match code {
                            ConnectReturnCode::BadUserNamePassword => {
                                self.notifier.notify(Notification::Info(
                                    "invalid token, requesting a new one".to_string(),
                                ));
                            }
                            _ => {
                                self.notifier.notify(Notification::Warning(
                                    "gear unauthorized".to_string(),
                                ));
                            }
                        }
                        return SessionOutcome::AuthRejected;
                    }
                    Err(err) => {
                        let was_connected = connected_tx.send_replace(false);
                        debug!("broker event loop error: {err}");
                        if was_connected {
                            self.notifier.notify(Notification::Disconnected);
                        }
                        // rumqttc redials on the next poll; pace the attempts
                        tokio::time::sleep(Duration::from_millis(self.config.reconnect_pause_ms))
                            .await;
                    }
                }
            }
        }
    }

    /// Re-establish the session's subscriptions after every (re)connect.
    async fn on_connected(&self, client: &AsyncClient, access: &AccessToken) {
        let appid = self.identity.appid();

        // control channel scoped to our own client identifier
        let control = router::control_channel(appid, &access.token);
        if let Err(err) = client.subscribe(&control, QoS::AtMostOnce).await {
            warn!("control channel subscription failed: {err}");
        }

        // saved application subscriptions, in recorded order
        let saved = self.subscriptions.lock().await.clone();
        for topic in saved {
            debug!(%topic, "re-applying subscription");
            if let Err(err) = client.subscribe(&topic, QoS::AtMostOnce).await {
                warn!(%topic, "re-subscription failed: {err}");
            }
        }

        // presence channels only carry traffic somebody is listening for
        if self.notifier.has_observers(Channel::Present) {
            let _ = client
                .subscribe(router::presence_topic(appid), QoS::AtMostOnce)
                .await;
        }
        if self.notifier.has_observers(Channel::Absent) {
            let _ = client
                .subscribe(router::absence_topic(appid), QoS::AtMostOnce)
                .await;
        }

        self.notifier.notify(Notification::Connected);
    }

    async fn on_publish(&self, topic: &str, payload: &bytes::Bytes) {
        match router::route(self.identity.appid(), topic, payload) {
            RoutedEvent::Present(value) => self.notifier.notify(Notification::Present(value)),
            RoutedEvent::Absent(value) => self.notifier.notify(Notification::Absent(value)),
            RoutedEvent::ResetEndpoint => {
                // blank the held endpoint so the next cycle re-resolves it
                if self.tokens.lock().await.reset_endpoint() {
                    self.notifier
                        .notify(Notification::Info("endpoint reset".to_string()));
                }
            }
            RoutedEvent::Info(text) => self.notifier.notify(Notification::Info(text)),
            RoutedEvent::Error(text) => self.notifier.notify(Notification::Error(text)),
            RoutedEvent::Message { topic, payload } => {
                self.notifier.notify(Notification::Message { topic, payload })
            }
            RoutedEvent::Ignored => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_subscription_appends_once() {
        let mut subs = Vec::new();
        record_subscription(&mut subs, "/APP/a".to_string());
        record_subscription(&mut subs, "/APP/b".to_string());
        record_subscription(&mut subs, "/APP/a".to_string());
        assert_eq!(subs, vec!["/APP/a".to_string(), "/APP/b".to_string()]);
    }

    #[test]
    fn test_record_subscription_preserves_order() {
        let mut subs = Vec::new();
        for topic in ["/APP/z", "/APP/a", "/APP/m"] {
            record_subscription(&mut subs, topic.to_string());
        }
        assert_eq!(subs, vec!["/APP/z", "/APP/a", "/APP/m"]);
    }

    #[test]
    fn test_auth_rejection_codes() {
        assert!(is_auth_rejection(ConnectReturnCode::BadUserNamePassword));
        assert!(is_auth_rejection(ConnectReturnCode::NotAuthorized));
        assert!(!is_auth_rejection(ConnectReturnCode::ServiceUnavailable));
        assert!(!is_auth_rejection(ConnectReturnCode::Success));
    }

    #[test]
    fn test_publish_options_default_not_retained() {
        assert!(!PublishOptions::default().retain);
    }
}
