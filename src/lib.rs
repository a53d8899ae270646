//! gearlink — device-side client for cloud message-broker platforms.
//!
//! A gear turns a pair of long-lived application credentials into a
//! short-lived broker session and keeps that session alive across network
//! failures. This crate implements the connection and authentication
//! orchestrator:
//! - the OAuth-style token-exchange state machine and its on-disk cache
//! - exponential backoff for token retries and full-cycle reconnects
//! - the broker session with derived per-session credentials
//! - the control-topic demultiplexer separating platform signaling
//!   (presence, endpoint resets) from application payloads
//!
//! # Quick start
//!
//! ```no_run
//! use gearlink::{Channel, ConnectOptions, Gear, GearConfig, Identity, PublishOptions};
//!
//! # async fn run() -> gearlink::GearResult<()> {
//! let identity = Identity::new("device-key", "device-secret", "myapp").with_alias("sensor-1");
//! let gear = Gear::new(identity, GearConfig::default());
//!
//! let mut messages = gear.listen(Channel::Message).await;
//! gear.connect(ConnectOptions::default()).await?;
//! gear.subscribe("/sensors/#").await?;
//! gear.publish("/sensors/1", "21.5", PublishOptions::default()).await?;
//!
//! while let Some(notification) = messages.recv().await {
//!     println!("{notification:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod gear;
pub mod identity;
pub mod logging;
pub mod notify;
pub mod session;
pub mod token;

pub use cache::CredentialCache;
pub use config::{ConfigError, GearConfig, MGREV};
pub use error::{GearError, GearResult};
pub use gear::{Gear, TokenBackoff};
pub use identity::Identity;
pub use notify::{Channel, Notification, Notifier};
pub use session::credentials::{derive_credentials, BrokerCredentials};
pub use session::{ConnectOptions, LastWill, PublishOptions};
pub use token::{AccessToken, RequestToken, TokenManager, TokenSignal};
