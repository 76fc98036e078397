//! Token lifecycle management
//!
//! Before every publish attempt the engine asks the [`TokenManager`] for a
//! usable access token. Tokens close to expiry are renewed first, using the
//! mechanism the vendor supports:
//!
//! - Facebook / Instagram: exchange the current token for a new long-lived one
//! - LinkedIn: no programmatic refresh; the stored token is used as-is
//! - X / TikTok: standard `refresh_token` grant
//!
//! Renewed credentials are encrypted and written back in one statement that
//! also reactivates the connection.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::config::{AppCredentials, AppsConfig, Config, EndpointsConfig};
use crate::db::Database;
use crate::error::{ConfigError, CredentialError, FanoutError, PlatformError, Result};
use crate::platforms::http;
use crate::types::{Connection, Platform};
use crate::vault::CredentialVault;

/// Credentials returned by a successful refresh
#[derive(Debug)]
pub struct RefreshedToken {
    pub access_token: SecretString,
    /// `None` when the provider did not rotate the refresh token
    pub refresh_token: Option<SecretString>,
    /// Lifetime in seconds, when the provider states one
    pub expires_in: Option<i64>,
}

/// Vendor token endpoints
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange a still-valid token for a new long-lived one (Meta)
    async fn exchange_long_lived(
        &self,
        platform: Platform,
        access_token: &SecretString,
    ) -> Result<RefreshedToken>;

    /// OAuth 2.0 `refresh_token` grant
    async fn refresh_grant(
        &self,
        platform: Platform,
        refresh_token: &SecretString,
    ) -> Result<RefreshedToken>;
}

/// [`TokenRefresher`] talking to the real vendor endpoints
pub struct OAuthRefreshClient {
    client: reqwest::Client,
    apps: AppsConfig,
    endpoints: EndpointsConfig,
}

impl OAuthRefreshClient {
    pub fn new(client: reqwest::Client, apps: AppsConfig, endpoints: EndpointsConfig) -> Self {
        Self {
            client,
            apps,
            endpoints,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let client = http::build_client(config.media.request_timeout())?;
        Ok(Self::new(client, config.apps.clone(), config.endpoints.clone()))
    }

    fn app<'a>(app: &'a Option<AppCredentials>, field: &str) -> Result<&'a AppCredentials> {
        app.as_ref()
            .ok_or_else(|| ConfigError::MissingField(field.to_string()).into())
    }

    async fn parse_token_response(
        platform: Platform,
        response: reqwest::Response,
    ) -> Result<RefreshedToken> {
        let name = platform.display_name();
        let body = http::read_json(name, response).await?;

        // TikTok answers 200 with an error object on failure
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            if !error.is_empty() && body.get("access_token").is_none() {
                let description = body
                    .get("error_description")
                    .and_then(Value::as_str)
                    .unwrap_or(error);
                return Err(PlatformError::Authentication(format!(
                    "{} token refresh rejected: {}",
                    name, description
                ))
                .into());
            }
        }

        let access_token = http::required_str(name, &body, "/access_token")?;
        let refresh_token = body
            .get("refresh_token")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.to_string()));
        let expires_in = body.get("expires_in").and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        });

        Ok(RefreshedToken {
            access_token: SecretString::from(access_token),
            refresh_token,
            expires_in,
        })
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefreshClient {
    async fn exchange_long_lived(
        &self,
        platform: Platform,
        access_token: &SecretString,
    ) -> Result<RefreshedToken> {
        if !matches!(platform, Platform::Facebook | Platform::Instagram) {
            return Err(PlatformError::NotImplemented(format!(
                "long-lived token exchange for {}",
                platform.display_name()
            ))
            .into());
        }
        let app = Self::app(&self.apps.meta, "apps.meta")?;

        let response = self
            .client
            .get(format!(
                "{}/oauth/access_token",
                self.endpoints.graph.trim_end_matches('/')
            ))
            .query(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", app.client_id.as_str()),
                ("client_secret", app.client_secret.as_str()),
                ("fb_exchange_token", access_token.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| http::transport_error(platform.display_name(), "token exchange", e))?;

        Self::parse_token_response(platform, response).await
    }

    async fn refresh_grant(
        &self,
        platform: Platform,
        refresh_token: &SecretString,
    ) -> Result<RefreshedToken> {
        let request = match platform {
            Platform::Twitter => {
                let app = Self::app(&self.apps.twitter, "apps.twitter")?;
                self.client
                    .post(format!(
                        "{}/2/oauth2/token",
                        self.endpoints.twitter_api.trim_end_matches('/')
                    ))
                    .basic_auth(&app.client_id, Some(&app.client_secret))
                    .form(&[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token.expose_secret()),
                        ("client_id", app.client_id.as_str()),
                    ])
            }
            Platform::Tiktok => {
                let app = Self::app(&self.apps.tiktok, "apps.tiktok")?;
                self.client
                    .post(format!(
                        "{}/v2/oauth/token/",
                        self.endpoints.tiktok.trim_end_matches('/')
                    ))
                    .form(&[
                        ("client_key", app.client_id.as_str()),
                        ("client_secret", app.client_secret.as_str()),
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token.expose_secret()),
                    ])
            }
            other => {
                return Err(PlatformError::NotImplemented(format!(
                    "refresh_token grant for {}",
                    other.display_name()
                ))
                .into())
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| http::transport_error(platform.display_name(), "token refresh", e))?;
        Self::parse_token_response(platform, response).await
    }
}

/// Hands out decrypted, unexpired access tokens
pub struct TokenManager {
    db: Database,
    vault: Arc<dyn CredentialVault>,
    refresher: Arc<dyn TokenRefresher>,
    margin_secs: i64,
}

impl TokenManager {
    /// Tokens expiring within `margin_secs` are renewed before use
    pub fn new(
        db: Database,
        vault: Arc<dyn CredentialVault>,
        refresher: Arc<dyn TokenRefresher>,
        margin_secs: i64,
    ) -> Self {
        Self {
            db,
            vault,
            refresher,
            margin_secs,
        }
    }

    fn needs_refresh(&self, expires_at: Option<i64>, now: i64) -> bool {
        match expires_at {
            None => false,
            Some(expires_at) => expires_at - now <= self.margin_secs,
        }
    }

    /// Decrypted access token for `connection`, renewed first if about to expire
    ///
    /// The connection is re-read from the store so a refresh done by another
    /// worker since the caller loaded it is picked up.
    pub async fn ensure_fresh_credential(&self, connection: &Connection) -> Result<SecretString> {
        let current = self
            .db
            .get_connection(&connection.id)
            .await?
            .ok_or_else(|| FanoutError::NotFound(format!("connection {}", connection.id)))?;

        let access_token = self.vault.decrypt(&current.access_token)?;
        let now = chrono::Utc::now().timestamp();
        if !self.needs_refresh(current.token_expires_at, now) {
            return Ok(access_token);
        }

        let platform = current.platform;
        tracing::debug!(
            connection_id = %current.id,
            platform = %platform,
            expires_at = ?current.token_expires_at,
            "Access token expiring, refreshing"
        );

        let refreshed = match platform {
            Platform::Facebook | Platform::Instagram => {
                self.refresher
                    .exchange_long_lived(platform, &access_token)
                    .await?
            }
            Platform::Linkedin => {
                tracing::warn!(
                    connection_id = %current.id,
                    "LinkedIn tokens cannot be refreshed programmatically, using stored token"
                );
                return Ok(access_token);
            }
            Platform::Twitter | Platform::Tiktok => {
                let stored = current
                    .refresh_token
                    .as_deref()
                    .ok_or_else(|| CredentialError::MissingRefreshToken(platform.to_string()))?;
                let refresh_token = self.vault.decrypt(stored)?;
                self.refresher.refresh_grant(platform, &refresh_token).await?
            }
        };

        self.persist(&current, refreshed, now).await
    }

    async fn persist(
        &self,
        connection: &Connection,
        refreshed: RefreshedToken,
        now: i64,
    ) -> Result<SecretString> {
        let access_ciphertext = self.vault.encrypt(&refreshed.access_token)?;
        let refresh_ciphertext = refreshed
            .refresh_token
            .as_ref()
            .map(|token| self.vault.encrypt(token))
            .transpose()?;
        let expires_at = refreshed.expires_in.map(|secs| now + secs);

        self.db
            .update_connection_tokens(
                &connection.id,
                &access_ciphertext,
                refresh_ciphertext.as_deref(),
                expires_at,
            )
            .await?;

        tracing::info!(
            connection_id = %connection.id,
            platform = %connection.platform,
            expires_at = ?expires_at,
            "Refreshed access token"
        );
        Ok(refreshed.access_token)
    }
}
