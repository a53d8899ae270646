//! Pure broker credential derivation and connection options.
//!
//! Everything here is a pure function of the identity, the access token and
//! the clock, kept separate from the session driver so the handshake inputs
//! can be tested without a broker.

use super::ConnectOptions;
use crate::config::GearConfig;
use crate::error::{GearError, GearResult};
use crate::identity::Identity;
use crate::token::signer::hmac_sha1_base64;
use crate::token::AccessToken;
use rumqttc::{LastWill as MqttLastWill, MqttOptions, QoS, Transport};
use std::time::Duration;
use url::Url;

/// Transport credentials for one broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
    pub client_id: String,
}

/// Derive the session credentials the broker authenticates.
///
/// The username carries the handshake time so the broker can reject replays;
/// the password binds token, username and both secrets together.
pub fn derive_credentials(
    identity: &Identity,
    access: &AccessToken,
    now_unix: i64,
) -> BrokerCredentials {
    let username = format!("{}%{}", identity.key(), now_unix);
    let password = hmac_sha1_base64(
        &format!("{}&{}", access.secret, identity.secret()),
        &format!("{}%{}", access.token, username),
    );
    BrokerCredentials {
        username,
        password,
        client_id: access.token.clone(),
    }
}

/// Extract the broker host from a resolved endpoint.
///
/// Endpoints arrive either as full URLs or as bare `host:port` strings; the
/// port always comes from the configuration, not the endpoint.
pub fn broker_host(access: &AccessToken) -> GearResult<String> {
    if let Ok(url) = Url::parse(&access.endpoint) {
        if let Some(host) = url.host_str() {
            return Ok(host.to_string());
        }
    }
    if let Ok(url) = Url::parse(&format!("mqtt://{}", access.endpoint)) {
        if let Some(host) = url.host_str() {
            return Ok(host.to_string());
        }
    }
    Err(GearError::InvalidEndpoint(access.endpoint.clone()))
}

/// Build the full MQTT connection options for one session attempt.
pub fn build_mqtt_options(
    identity: &Identity,
    config: &GearConfig,
    access: &AccessToken,
    options: &ConnectOptions,
    now_unix: i64,
) -> GearResult<MqttOptions> {
    let credentials = derive_credentials(identity, access, now_unix);
    let host = broker_host(access)?;

    let mut mqtt_options =
        MqttOptions::new(credentials.client_id, host, config.active_broker_port());
    mqtt_options.set_credentials(credentials.username, credentials.password);
    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    if config.secure {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }
    if let Some(will) = &options.will {
        mqtt_options.set_last_will(MqttLastWill::new(
            &will.topic,
            will.payload.clone(),
            QoS::AtMostOnce,
            will.retain,
        ));
    }
    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LastWill;

    fn test_access() -> AccessToken {
        AccessToken {
            token: "ATOKEN".into(),
            secret: "ASECRET".into(),
            appkey: "AK".into(),
            endpoint: "mqtt://gb.example.com:1883".into(),
            revokecode: String::new(),
        }
    }

    fn test_identity() -> Identity {
        Identity::new("KEY", "GSECRET", "APP")
    }

    #[test]
    fn test_username_carries_handshake_time() {
        let creds = derive_credentials(&test_identity(), &test_access(), 1_700_000_000);
        assert_eq!(creds.username, "KEY%1700000000");
    }

    #[test]
    fn test_password_vector() {
        // HMAC-SHA1("ATOKEN%KEY%1700000000", key "ASECRET&GSECRET"), base64
        let creds = derive_credentials(&test_identity(), &test_access(), 1_700_000_000);
        assert_eq!(creds.password, "dbeYnGHVtKQxMYlKrEbUP1soLxM=");
    }

    #[test]
    fn test_client_id_is_access_token() {
        let creds = derive_credentials(&test_identity(), &test_access(), 1_700_000_000);
        assert_eq!(creds.client_id, "ATOKEN");
    }

    #[test]
    fn test_broker_host_from_url_endpoint() {
        assert_eq!(broker_host(&test_access()).unwrap(), "gb.example.com");
    }

    #[test]
    fn test_broker_host_from_bare_endpoint() {
        let mut access = test_access();
        access.endpoint = "gb.example.com:1883".into();
        assert_eq!(broker_host(&access).unwrap(), "gb.example.com");
    }

    #[test]
    fn test_broker_host_rejects_garbage() {
        let mut access = test_access();
        access.endpoint = "://".into();
        assert!(matches!(
            broker_host(&access),
            Err(GearError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_build_mqtt_options_uses_configured_port() {
        let config = GearConfig::default();
        let options = build_mqtt_options(
            &test_identity(),
            &config,
            &test_access(),
            &ConnectOptions::default(),
            1_700_000_000,
        )
        .unwrap();
        assert_eq!(options.broker_address(), ("gb.example.com".to_string(), 1883));
    }

    #[test]
    fn test_build_mqtt_options_with_will() {
        let config = GearConfig::default();
        let connect = ConnectOptions {
            will: Some(LastWill {
                topic: "/APP/offline".into(),
                payload: "gone".into(),
                retain: false,
            }),
        };
        let options = build_mqtt_options(
            &test_identity(),
            &config,
            &test_access(),
            &connect,
            1_700_000_000,
        );
        assert!(options.is_ok());
    }
}
