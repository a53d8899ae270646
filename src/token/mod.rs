//! Token-exchange state machine.
//!
//! Drives the request-token → access-token → endpoint-resolution flow
//! against the platform API, persisting progress through the credential
//! cache so a restarted device resumes where it left off. Each call to
//! [`TokenManager::advance`] performs at most one exchange step and reports
//! a [`TokenSignal`] telling the orchestrator how to proceed.

pub mod signer;

use crate::cache::{self, CredentialCache};
use crate::config::{GearConfig, MGREV};
use crate::error::{GearError, GearResult};
use crate::identity::Identity;
use crate::notify::{Notification, Notifier};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use signer::OauthSigner;
use std::sync::Arc;
use tracing::{debug, warn};

/// First-step OAuth token, consumed exactly once to obtain an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestToken {
    pub token: String,
    pub secret: String,
    pub verifier: String,
}

/// Authorized broker credential.
///
/// An empty `endpoint` is a distinct sub-state, not an error: the token is
/// resolved but the broker address has not been fetched yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub secret: String,
    #[serde(default)]
    pub appkey: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub revokecode: String,
}

impl AccessToken {
    pub fn has_endpoint(&self) -> bool {
        !self.endpoint.is_empty()
    }
}

/// Outcome of one [`TokenManager::advance`] step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSignal {
    /// Request-token issuance failed outright (bad key/secret); the caller
    /// should not busy-loop.
    Rejected,
    /// Waiting on end-user authorization; retry after backoff.
    Pending,
    /// Forward progress was made; retry immediately and reset the backoff.
    Progress,
    /// Access token and endpoint are both resolved; ready for the broker.
    Ready,
}

/// Derive the revocation code for a freshly exchanged access token.
fn revoke_code(token: &str, token_secret: &str, gear_secret: &str) -> String {
    signer::hmac_sha1_base64(&format!("{token_secret}&{gear_secret}"), token).replace('/', "_")
}

/// State machine driving the token exchange for one gear.
pub struct TokenManager {
    identity: Identity,
    config: GearConfig,
    cache: CredentialCache,
    notifier: Arc<Notifier>,
    http: reqwest::Client,
    access: Option<AccessToken>,
    request: Option<RequestToken>,
}

impl TokenManager {
    pub fn new(
        identity: Identity,
        config: GearConfig,
        cache: CredentialCache,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            identity,
            config,
            cache,
            notifier,
            http: reqwest::Client::new(),
            access: None,
            request: None,
        }
    }

    /// Currently held access token, if any.
    pub fn access_token(&self) -> Option<&AccessToken> {
        self.access.as_ref()
    }

    /// Drop all token state, in memory and on disk.
    pub fn invalidate(&mut self) {
        self.access = None;
        self.request = None;
        self.cache.clear(None);
    }

    /// Blank the held endpoint so the next cycle re-resolves it.
    ///
    /// Returns true when there was a non-empty endpoint to blank.
    pub fn reset_endpoint(&mut self) -> bool {
        if self.access.is_none() {
            self.access = self.cached_access();
        }
        match &mut self.access {
            Some(access) if access.has_endpoint() => {
                access.endpoint.clear();
                let access = access.clone();
                self.persist_access(&access);
                true
            }
            _ => false,
        }
    }

    fn cached_access(&self) -> Option<AccessToken> {
        self.cache
            .get(cache::ACCESS_TOKEN_FIELD)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    fn cached_request(&self) -> Option<RequestToken> {
        self.cache
            .get(cache::REQUEST_TOKEN_FIELD)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    fn persist_access(&self, access: &AccessToken) {
        if let Ok(value) = serde_json::to_value(access) {
            self.cache.set(cache::ACCESS_TOKEN_FIELD, value);
        }
    }

    /// Run one step of the exchange.
    pub async fn advance(&mut self) -> TokenSignal {
        // identity rotation: a cache written by a different key is void
        if let Some(cached_key) = self
            .cache
            .get(cache::KEY_FIELD)
            .and_then(|v| v.as_str().map(str::to_string))
        {
            if cached_key != self.identity.key() {
                debug!("cached identity key differs, invalidating stored tokens");
                self.invalidate();
            }
        }
        self.cache
            .set(cache::KEY_FIELD, Value::String(self.identity.key().into()));

        if self.access.is_none() {
            self.access = self.cached_access();
        }
        if let Some(access) = &self.access {
            if access.has_endpoint() {
                return TokenSignal::Ready;
            }
            return self.fetch_endpoint().await;
        }

        if self.request.is_none() {
            self.request = self.cached_request();
        }
        if self.request.is_some() {
            return self.exchange_access_token().await;
        }

        self.issue_request_token().await
    }

    /// Resolve the broker endpoint for an already-authorized access token.
    async fn fetch_endpoint(&mut self) -> TokenSignal {
        let url = format!(
            "{}/api/endpoint/{}",
            self.config.api_base_url(),
            self.identity.key()
        );
        let body = match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                response.text().await.unwrap_or_default()
            }
            Ok(response) => {
                debug!(status = %response.status(), "endpoint lookup failed");
                return TokenSignal::Progress;
            }
            Err(err) => {
                debug!("endpoint lookup failed: {err}");
                return TokenSignal::Progress;
            }
        };
        if body.is_empty() {
            return TokenSignal::Progress;
        }

        if let Some(access) = &mut self.access {
            access.endpoint = body;
            let access = access.clone();
            self.persist_access(&access);
            debug!(endpoint = %access.endpoint, "broker endpoint resolved");
            return TokenSignal::Ready;
        }
        TokenSignal::Progress
    }

    /// Exchange the held request token for an access token.
    async fn exchange_access_token(&mut self) -> TokenSignal {
        let Some(request) = self.request.clone() else {
            return TokenSignal::Progress;
        };
        let url = format!("{}/api/atoken", self.config.api_base_url());
        let signer = OauthSigner::new(self.identity.key(), self.identity.secret());
        let authorization = signer.authorize(
            "POST",
            &url,
            Some((request.token.as_str(), request.secret.as_str())),
            &[("oauth_verifier", request.verifier.as_str())],
            &[],
        );

        let response = match self
            .http
            .post(&url)
            .header(AUTHORIZATION, authorization)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!("access token exchange failed: {err}");
                self.notifier
                    .notify(Notification::Rejected("request token rejected".to_string()));
                return TokenSignal::Pending;
            }
        };

        match response.status() {
            status if status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                self.accept_access_token(&body)
            }
            // token issued but the end user has not authorized it yet
            StatusCode::UNAUTHORIZED => TokenSignal::Pending,
            status => {
                debug!(%status, "access token exchange rejected");
                self.notifier
                    .notify(Notification::Rejected("request token rejected".to_string()));
                TokenSignal::Pending
            }
        }
    }

    fn accept_access_token(&mut self, body: &str) -> TokenSignal {
        let fields = signer::parse_form(body);
        let Some(token) = fields.get("oauth_token").filter(|t| !t.is_empty()) else {
            self.notifier
                .notify(Notification::Rejected("request token rejected".to_string()));
            return TokenSignal::Pending;
        };
        let secret = fields.get("oauth_token_secret").cloned().unwrap_or_default();
        let access = AccessToken {
            token: token.clone(),
            revokecode: revoke_code(token, &secret, self.identity.secret()),
            secret,
            appkey: fields.get("appkey").cloned().unwrap_or_default(),
            endpoint: fields.get("endpoint").cloned().unwrap_or_default(),
        };

        // a single-use token never goes to disk; anything cached would be
        // stale the moment the session ends
        let single_use = fields.get("flag").map(String::as_str) == Some("S");
        if single_use {
            self.cache.clear(None);
        } else {
            self.persist_access(&access);
            self.cache.clear(Some(cache::REQUEST_TOKEN_FIELD));
        }
        self.access = Some(access);
        self.request = None;
        TokenSignal::Progress
    }

    /// Issue a fresh request token.
    async fn issue_request_token(&mut self) -> TokenSignal {
        let url = format!("{}/api/rtoken", self.config.api_base_url());
        let verifier = self.identity.verifier().to_string();
        let body_params = [
            ("scope", self.config.scope.as_str()),
            ("appid", self.identity.appid()),
            ("mgrev", MGREV),
            ("verifier", verifier.as_str()),
        ];
        let signer = OauthSigner::new(self.identity.key(), self.identity.secret());
        let authorization = signer.authorize("POST", &url, None, &[], &body_params);
        let body = signer::encode_form(&body_params);

        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, authorization)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await;
        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(status = %response.status(), "request token was not issued");
                return TokenSignal::Rejected;
            }
            Err(err) => {
                debug!("request token exchange failed: {err}");
                return TokenSignal::Rejected;
            }
        };

        let fields = signer::parse_form(&response.text().await.unwrap_or_default());
        let (Some(token), Some(secret)) =
            (fields.get("oauth_token"), fields.get("oauth_token_secret"))
        else {
            return TokenSignal::Rejected;
        };
        let request = RequestToken {
            token: token.clone(),
            secret: secret.clone(),
            verifier,
        };
        if let Ok(value) = serde_json::to_value(&request) {
            self.cache.set(cache::REQUEST_TOKEN_FIELD, value);
        }
        self.request = Some(request);
        debug!("request token issued, waiting for authorization");
        TokenSignal::Pending
    }

    /// Revoke the cached access token and wipe the cache.
    ///
    /// With no token cached this succeeds immediately without any network
    /// call.
    pub async fn revoke(&mut self) -> GearResult<()> {
        let Some(access) = self.cached_access() else {
            self.access = None;
            self.request = None;
            return Ok(());
        };
        let code = access.revokecode.replace('/', "_");
        let url = format!(
            "{}/api/revoke/{}/{}",
            self.config.api_base_url(),
            access.token,
            code
        );
        let body = self.http.get(&url).send().await?.text().await?;
        if body == "FAILED" {
            return Err(GearError::revoke_failed(body));
        }
        self.invalidate();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoke_code_has_no_slashes() {
        let code = revoke_code("TOKEN123", "TSECRET", "GSECRET");
        assert_eq!(code, "IAidNiwdZBNaDcuNCjCRrF9YTsk=");
        assert!(!code.contains('/'));
    }

    #[test]
    fn test_access_token_endpoint_substate() {
        let mut token = AccessToken {
            token: "t".into(),
            secret: "s".into(),
            appkey: String::new(),
            endpoint: String::new(),
            revokecode: String::new(),
        };
        assert!(!token.has_endpoint());
        token.endpoint = "mqtt://broker:1883".into();
        assert!(token.has_endpoint());
    }

    #[test]
    fn test_access_token_deserializes_with_missing_fields() {
        let token: AccessToken =
            serde_json::from_value(serde_json::json!({"token": "t", "secret": "s"})).unwrap();
        assert_eq!(token.endpoint, "");
        assert_eq!(token.appkey, "");
    }
}
