//! Connection orchestrator and public gear API.
//!
//! [`Gear`] is the top-level driver: it loops the token-exchange state
//! machine under backoff until a usable access token exists, hands off to a
//! broker session, and restarts the whole cycle when the broker reports the
//! credentials stale. The loop runs in one spawned supervisor task per gear;
//! every continuation closes over explicit `Arc` references to the owning
//! state, so two gears in one process never share anything.

use crate::cache::CredentialCache;
use crate::config::GearConfig;
use crate::error::{GearError, GearResult};
use crate::identity::Identity;
use crate::notify::{Channel, Notification, Notifier};
use crate::session::{
    router, BrokerSession, ConnectOptions, PublishOptions, SessionHandle, SessionOutcome,
};
use crate::token::{TokenManager, TokenSignal};
use rumqttc::QoS;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Exponential backoff for the token-retry loop.
///
/// The delay doubles on every consecutive pending signal and is clamped to
/// the ceiling; any forward progress resets it to the floor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBackoff {
    floor: u64,
    ceiling: u64,
    current: u64,
}

impl TokenBackoff {
    pub fn new(floor_ms: u64, ceiling_ms: u64) -> Self {
        let floor = floor_ms.max(1);
        Self {
            floor,
            ceiling: ceiling_ms.max(floor),
            current: floor,
        }
    }

    /// The delay to wait now; doubles the next one up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current.saturating_mul(2)).min(self.ceiling);
        Duration::from_millis(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// Interruptible sleep; false means shutdown was requested.
async fn sleep_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => changed.is_ok() && !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Rewrite a last-will topic into the application namespace.
fn namespace_will(options: &mut ConnectOptions, appid: &str) {
    if let Some(will) = &mut options.will {
        will.topic = router::namespaced(appid, &will.topic);
    }
}

/// Build the feed-write topic, optionally carrying an API key segment.
fn feed_topic(feed_id: &str, api_key: Option<&str>) -> String {
    match api_key {
        Some(key) => format!("/@writefeed/{feed_id}/{key}"),
        None => format!("/@writefeed/{feed_id}"),
    }
}

/// Feed payloads are posted as JSON text; bare strings go through raw.
fn feed_payload(data: &Value) -> String {
    match data {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// One client instance of the platform, identified by key/secret/appid.
pub struct Gear {
    identity: Identity,
    config: GearConfig,
    notifier: Arc<Notifier>,
    tokens: Arc<Mutex<TokenManager>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    session: Arc<Mutex<Option<SessionHandle>>>,
    options: Arc<Mutex<ConnectOptions>>,
    gearname: Mutex<Option<String>>,
    generation: Arc<AtomicU64>,
    shutdown: StdMutex<Option<watch::Sender<bool>>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl Gear {
    pub fn new(identity: Identity, config: GearConfig) -> Self {
        let cache = match &config.cache_file {
            Some(path) => CredentialCache::at_path(path.clone()),
            None => CredentialCache::for_key(&config.cache_dir, identity.key()),
        };
        let notifier = Arc::new(Notifier::new());
        let tokens = Arc::new(Mutex::new(TokenManager::new(
            identity.clone(),
            config.clone(),
            cache,
            notifier.clone(),
        )));
        Self {
            identity,
            config,
            notifier,
            tokens,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            session: Arc::new(Mutex::new(None)),
            options: Arc::new(Mutex::new(ConnectOptions::default())),
            gearname: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            shutdown: StdMutex::new(None),
            supervisor: StdMutex::new(None),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &GearConfig {
        &self.config
    }

    /// Register an observer for a notification channel.
    ///
    /// The first observer of `present` or `absent` triggers the matching
    /// platform subscription when a session is live; later reconnects keep
    /// it applied.
    pub async fn listen(&self, channel: Channel) -> mpsc::UnboundedReceiver<Notification> {
        let (rx, first) = self.notifier.listen(channel);
        if first {
            let topic = match channel {
                Channel::Present => Some(router::presence_topic(self.identity.appid())),
                Channel::Absent => Some(router::absence_topic(self.identity.appid())),
                _ => None,
            };
            if let Some(topic) = topic {
                if let Some(handle) = self.live_session().await {
                    debug!(%topic, "first observer registered, subscribing");
                    let _ = handle.client.subscribe(topic.clone(), QoS::AtMostOnce).await;
                    crate::session::record_subscription(
                        &mut *self.subscriptions.lock().await,
                        topic,
                    );
                }
            }
        }
        rx
    }

    /// Initiate the connection cycle and wait for the first broker session.
    ///
    /// Returns once connected, or with an error when the platform rejects
    /// the application credentials outright.
    pub async fn connect(&self, options: ConnectOptions) -> GearResult<()> {
        if self.shutdown.lock().expect("gear lock poisoned").is_some() {
            return Err(GearError::AlreadyConnected);
        }

        let mut options = options;
        namespace_will(&mut options, self.identity.appid());
        *self.options.lock().await = options;

        let (mut connected_rx, _) = self.notifier.listen(Channel::Connected);
        let (fatal_tx, mut fatal_rx) = watch::channel::<Option<String>>(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = Supervisor {
            identity: self.identity.clone(),
            config: self.config.clone(),
            notifier: self.notifier.clone(),
            tokens: self.tokens.clone(),
            subscriptions: self.subscriptions.clone(),
            session: self.session.clone(),
            options: self.options.clone(),
            generation: self.generation.clone(),
            fatal: fatal_tx,
        };
        let handle = tokio::spawn(supervisor.run(shutdown_rx));
        *self.shutdown.lock().expect("gear lock poisoned") = Some(shutdown_tx);
        *self.supervisor.lock().expect("gear lock poisoned") = Some(handle);

        let result = tokio::select! {
            connected = connected_rx.recv() => match connected {
                Some(_) => Ok(()),
                None => Err(GearError::connect_aborted("connection cycle ended")),
            },
            changed = fatal_rx.changed() => {
                let reason = if changed.is_ok() {
                    fatal_rx.borrow().clone()
                } else {
                    None
                };
                match reason {
                    Some(reason) => Err(GearError::token_rejected(reason)),
                    None => Err(GearError::connect_aborted("connection cycle ended")),
                }
            }
        };
        if result.is_err() {
            // the cycle is over; free the slots so connect can be retried
            self.shutdown.lock().expect("gear lock poisoned").take();
            self.supervisor.lock().expect("gear lock poisoned").take();
        }
        result
    }

    /// Close the active session.
    ///
    /// Cached tokens are kept; a later [`connect`](Self::connect) resumes
    /// from the cache. Safe to call at any point, including mid-handshake.
    pub async fn disconnect(&self) -> GearResult<()> {
        let shutdown = self.shutdown.lock().expect("gear lock poisoned").take();
        let supervisor = self.supervisor.lock().expect("gear lock poisoned").take();
        let Some(shutdown) = shutdown else {
            return Ok(());
        };
        let _ = shutdown.send(true);
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        self.notifier.notify(Notification::Disconnected);
        Ok(())
    }

    /// Whether a broker session is currently established.
    pub async fn is_connected(&self) -> bool {
        self.live_session().await.is_some()
    }

    async fn live_session(&self) -> Option<SessionHandle> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|handle| handle.is_connected())
            .cloned()
    }

    async fn require_session(&self, action: &str) -> GearResult<SessionHandle> {
        match self.live_session().await {
            Some(handle) => Ok(handle),
            None => {
                self.notifier.notify(Notification::Error(format!(
                    "gear is disconnected, cannot {action}."
                )));
                Err(GearError::NotConnected)
            }
        }
    }

    /// Publish a message on a topic under the application namespace.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> GearResult<()> {
        let handle = self.require_session("publish").await?;
        let full = router::namespaced(self.identity.appid(), topic);
        handle
            .client
            .publish(full, QoS::AtMostOnce, options.retain, payload)
            .await?;
        Ok(())
    }

    /// Subscribe to a topic under the application namespace.
    ///
    /// Successful subscriptions are recorded and re-applied, in order, after
    /// every reconnect.
    pub async fn subscribe(&self, topic: &str) -> GearResult<()> {
        let handle = self.require_session("subscribe").await?;
        let full = router::namespaced(self.identity.appid(), topic);
        handle.client.subscribe(full.clone(), QoS::AtMostOnce).await?;
        crate::session::record_subscription(&mut *self.subscriptions.lock().await, full);
        Ok(())
    }

    /// Unsubscribe from a topic and drop it from the saved set.
    pub async fn unsubscribe(&self, topic: &str) -> GearResult<()> {
        let handle = self.require_session("unsubscribe").await?;
        let full = router::namespaced(self.identity.appid(), topic);
        handle.client.unsubscribe(full.clone()).await?;
        self.subscriptions.lock().await.retain(|t| t != &full);
        Ok(())
    }

    /// Rename this gear's alias platform-side.
    pub async fn set_alias(&self, alias: &str) -> GearResult<()> {
        self.publish(&format!("/@setalias/{alias}"), "", PublishOptions::default())
            .await
    }

    /// Send a message to a gear addressed by name.
    pub async fn chat(&self, gearname: &str, payload: impl Into<Vec<u8>>) -> GearResult<()> {
        self.publish(
            &format!("/gearname/{gearname}"),
            payload,
            PublishOptions::default(),
        )
        .await
    }

    /// Claim an addressed-chat name by subscribing to its channel.
    #[deprecated(note = "use `set_alias` instead")]
    pub async fn set_name(&self, gearname: &str) -> GearResult<()> {
        let previous = self.gearname.lock().await.clone();
        if let Some(previous) = previous {
            self.unsubscribe(&format!("/gearname/{previous}")).await?;
        }
        self.subscribe(&format!("/gearname/{gearname}")).await?;
        *self.gearname.lock().await = Some(gearname.to_string());
        Ok(())
    }

    /// Release a name claimed with [`set_name`](Self::set_name).
    #[deprecated(note = "use `set_alias` instead")]
    pub async fn unset_name(&self) -> GearResult<()> {
        let previous = self.gearname.lock().await.take();
        if let Some(previous) = previous {
            self.unsubscribe(&format!("/gearname/{previous}")).await?;
        }
        Ok(())
    }

    /// Write a record to a named feed, optionally authorized by an API key.
    pub async fn write_feed(
        &self,
        feed_id: &str,
        data: &Value,
        api_key: Option<&str>,
    ) -> GearResult<()> {
        self.publish(
            &feed_topic(feed_id, api_key),
            feed_payload(data),
            PublishOptions::default(),
        )
        .await
    }

    /// Request the content of a postbox; it arrives on
    /// `/@readpostbox/<box>` as an ordinary message.
    pub async fn read_postbox(&self, box_name: &str) -> GearResult<()> {
        self.publish(
            &format!("/@readpostbox/{box_name}"),
            "",
            PublishOptions::default(),
        )
        .await
    }

    /// Store data in a postbox.
    pub async fn write_postbox(
        &self,
        box_name: &str,
        data: impl Into<Vec<u8>>,
    ) -> GearResult<()> {
        self.publish(
            &format!("/@writepostbox/{box_name}"),
            data,
            PublishOptions::default(),
        )
        .await
    }

    /// Revoke the cached access token and wipe the credential cache.
    ///
    /// With no token cached this succeeds immediately without touching the
    /// network.
    pub async fn reset_token(&self) -> GearResult<()> {
        let result = self.tokens.lock().await.revoke().await;
        if let Err(err) = &result {
            self.notifier
                .notify(Notification::Error(format!("reset token error : {err}")));
        }
        result
    }
}

/// Owned state of the connection cycle; runs until shutdown or a fatal
/// credential rejection.
struct Supervisor {
    identity: Identity,
    config: GearConfig,
    notifier: Arc<Notifier>,
    tokens: Arc<Mutex<TokenManager>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    session: Arc<Mutex<Option<SessionHandle>>>,
    options: Arc<Mutex<ConnectOptions>>,
    generation: Arc<AtomicU64>,
    fatal: watch::Sender<Option<String>>,
}

impl Supervisor {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let retry_interval = Duration::from_millis(self.config.retry_interval_ms);
        loop {
            let Some(()) = self.token_phase(&mut shutdown_rx).await else {
                return;
            };

            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let access = match self.tokens.lock().await.access_token().cloned() {
                Some(access) => access,
                None => continue,
            };
            let options = self.options.lock().await.clone();
            let session = BrokerSession {
                identity: self.identity.clone(),
                config: self.config.clone(),
                notifier: self.notifier.clone(),
                tokens: self.tokens.clone(),
                subscriptions: self.subscriptions.clone(),
                generation,
            };

            match session
                .run(access, &options, &self.session, shutdown_rx.clone())
                .await
            {
                Ok(SessionOutcome::Shutdown) => return,
                Ok(SessionOutcome::AuthRejected) => {
                    // the token went stale; never retry the session with it
                    info!("broker rejected credentials, restarting the token cycle");
                    self.tokens.lock().await.invalidate();
                    if !sleep_or_shutdown(&mut shutdown_rx, retry_interval).await {
                        return;
                    }
                }
                Err(err) => {
                    warn!("broker session failed: {err}");
                    self.notifier
                        .notify(Notification::Warning(format!("broker session failed: {err}")));
                    // a bad endpoint is re-resolved on the next cycle
                    self.tokens.lock().await.reset_endpoint();
                    if !sleep_or_shutdown(&mut shutdown_rx, retry_interval).await {
                        return;
                    }
                }
            }
        }
    }

    /// Loop the token state machine until `Ready`; `None` means stop.
    async fn token_phase(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Option<()> {
        let mut backoff =
            TokenBackoff::new(self.config.min_token_delay_ms, self.config.max_token_delay_ms);
        loop {
            if *shutdown_rx.borrow() {
                return None;
            }
            let signal = self.tokens.lock().await.advance().await;
            match signal {
                TokenSignal::Rejected => {
                    error!("request token was not issued; check the gear key and secret");
                    let reason = "request token not issued".to_string();
                    self.notifier.notify(Notification::Rejected(reason.clone()));
                    let _ = self.fatal.send(Some(reason));
                    return None;
                }
                TokenSignal::Pending => {
                    let delay = backoff.next_delay();
                    debug!(delay_ms = delay.as_millis() as u64, "token exchange pending");
                    if !sleep_or_shutdown(shutdown_rx, delay).await {
                        return None;
                    }
                }
                TokenSignal::Progress => backoff.reset(),
                TokenSignal::Ready => {
                    backoff.reset();
                    return Some(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = TokenBackoff::new(100, 30_000);
        let mut last = Duration::ZERO;
        let mut delays = Vec::new();
        for _ in 0..12 {
            let delay = backoff.next_delay();
            assert!(delay >= last, "backoff must be monotonically non-decreasing");
            last = delay;
            delays.push(delay.as_millis() as u64);
        }
        assert_eq!(delays[0], 100);
        assert_eq!(delays[1], 200);
        assert!(delays.iter().all(|&d| d <= 30_000));
        assert_eq!(*delays.last().unwrap(), 30_000);
    }

    #[test]
    fn test_backoff_reset_returns_to_floor() {
        let mut backoff = TokenBackoff::new(100, 30_000);
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_zero_floor_still_progresses() {
        let mut backoff = TokenBackoff::new(0, 10);
        assert_eq!(backoff.next_delay(), Duration::from_millis(1));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_sleep_or_shutdown_completes() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(sleep_or_shutdown(&mut rx, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_sleep_or_shutdown_interrupted() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(true);
        });
        assert!(!sleep_or_shutdown(&mut rx, Duration::from_secs(5)).await);
    }

    #[test]
    fn test_namespace_will_rewrites_topic() {
        let mut options = ConnectOptions {
            will: Some(crate::session::LastWill {
                topic: "/offline".into(),
                payload: "gone".into(),
                retain: false,
            }),
        };
        namespace_will(&mut options, "APP");
        assert_eq!(options.will.unwrap().topic, "/APP/offline");
    }

    #[test]
    fn test_namespace_will_without_will() {
        let mut options = ConnectOptions::default();
        namespace_will(&mut options, "APP");
        assert_eq!(options.will, None);
    }

    #[test]
    fn test_feed_topic_with_and_without_key() {
        assert_eq!(feed_topic("temperature", None), "/@writefeed/temperature");
        assert_eq!(
            feed_topic("temperature", Some("APIKEY")),
            "/@writefeed/temperature/APIKEY"
        );
    }

    #[test]
    fn test_feed_payload_formats() {
        assert_eq!(feed_payload(&json!({"t": 21.5})), r#"{"t":21.5}"#);
        assert_eq!(feed_payload(&json!("raw text")), "raw text");
    }

    fn offline_gear() -> (tempfile::TempDir, Gear) {
        let dir = tempfile::tempdir().unwrap();
        let config = GearConfig::default().with_cache_dir(dir.path());
        let gear = Gear::new(Identity::new("K", "S", "A"), config);
        (dir, gear)
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_notifies_error() {
        let (_dir, gear) = offline_gear();
        let mut errors = gear.listen(Channel::Error).await;

        let result = gear.publish("/t", "x", PublishOptions::default()).await;
        assert!(matches!(result, Err(GearError::NotConnected)));
        assert_eq!(
            errors.recv().await,
            Some(Notification::Error(
                "gear is disconnected, cannot publish.".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_notifies_error() {
        let (_dir, gear) = offline_gear();
        let mut errors = gear.listen(Channel::Error).await;

        let result = gear.subscribe("/t").await;
        assert!(matches!(result, Err(GearError::NotConnected)));
        assert!(matches!(
            errors.recv().await,
            Some(Notification::Error(_))
        ));
    }

    #[tokio::test]
    async fn test_chat_while_disconnected_fails() {
        let (_dir, gear) = offline_gear();
        assert!(matches!(
            gear.chat("other", "hello").await,
            Err(GearError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_noop() {
        let (_dir, gear) = offline_gear();
        assert!(gear.disconnect().await.is_ok());
        assert!(!gear.is_connected().await);
    }

    #[tokio::test]
    async fn test_reset_token_without_cache_succeeds_offline() {
        let (_dir, gear) = offline_gear();
        assert!(gear.reset_token().await.is_ok());
    }
}
