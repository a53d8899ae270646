//! Gear identity: the long-lived application credentials.

use crate::config::MGREV;
use std::fmt::Debug;

/// Maximum alias length accepted by the platform.
const MAX_ALIAS_LEN: usize = 16;

/// Long-lived credentials identifying one gear.
///
/// Immutable for the lifetime of an instance; renaming via `set_alias`
/// happens platform-side and does not mutate the identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    key: String,
    secret: String,
    alias: Option<String>,
    appid: String,
}

impl Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(Identity))
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .field("alias", &self.alias)
            .field("appid", &self.appid)
            .finish()
    }
}

impl Identity {
    /// Creates a new [`Identity`] without an alias.
    pub fn new<S: Into<String>>(key: S, secret: S, appid: S) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
            alias: None,
            appid: appid.into(),
        }
    }

    /// Attach an alias, truncated to the platform limit of 16 characters.
    pub fn with_alias(mut self, alias: &str) -> Self {
        let truncated: String = alias.chars().take(MAX_ALIAS_LEN).collect();
        self.alias = if truncated.is_empty() {
            None
        } else {
            Some(truncated)
        };
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn appid(&self) -> &str {
        &self.appid
    }

    /// OAuth verifier sent with the request-token exchange: the alias when
    /// one is set, the protocol revision tag otherwise.
    pub fn verifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(MGREV)
    }
}
