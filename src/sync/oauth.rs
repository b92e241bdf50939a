use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;

use super::config::{Credentials, DriveEndpoints};
use super::drive::{DriveClient, DriveError, DriveReply, DriveRequest};
use super::tokens::{TokenState, TokenStore, TokenStoreError};

/// Refresh when the access token expires within this many seconds.
pub const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("OAuth client id or secret is not configured")]
    MissingClientCredentials,
    #[error("Authorization code is empty")]
    EmptyCode,
    #[error("No refresh token available")]
    NoRefreshToken,
    #[error("A token refresh is already in flight")]
    RefreshInProgress,
    #[error("No token refresh is outstanding")]
    NoRefreshPending,
    #[error("Token endpoint returned no access token")]
    EmptyGrant,
    #[error("Token request failed: {0}")]
    Request(#[from] DriveError),
    #[error("Token store error: {0}")]
    Store(#[from] TokenStoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
}

/// Form fields for a token endpoint call. Debug output omits the values.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenForm {
    grant: GrantType,
    fields: Vec<(String, String)>,
}

impl TokenForm {
    pub fn grant(&self) -> GrantType {
        self.grant
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Debug for TokenForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.fields.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("TokenForm")
            .field("grant", &self.grant)
            .field("fields", &keys)
            .finish()
    }
}

/// Token endpoint response body.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &format!("<{} chars>", self.access_token.len()))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// What the periodic token check should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Unauthenticated,
    Fresh,
    /// Inside the refresh margin and a refresh token exists.
    RefreshDue,
    /// Expired with no way to refresh; the user must reconnect.
    Expired,
}

/// Owns the OAuth token state. Every mutation is persisted immediately.
pub struct OAuthClient {
    credentials: Credentials,
    endpoints: DriveEndpoints,
    store: TokenStore,
    tokens: TokenState,
    refresh_in_flight: bool,
}

impl OAuthClient {
    /// Load persisted tokens from `store`.
    pub fn new(
        credentials: Credentials,
        endpoints: DriveEndpoints,
        store: TokenStore,
    ) -> Result<Self, AuthError> {
        let tokens = store.load()?;
        if tokens.is_authenticated() {
            log::info!("OAuth: restored session, access token {}", tokens.redacted());
        }
        Ok(Self {
            credentials,
            endpoints,
            store,
            tokens,
            refresh_in_flight: false,
        })
    }

    pub fn tokens(&self) -> &TokenState {
        &self.tokens
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_authenticated()
    }

    pub fn access_token(&self) -> Option<&str> {
        Some(self.tokens.access_token.as_str()).filter(|t| !t.is_empty())
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.refresh_in_flight
    }

    fn has_client(&self) -> bool {
        !self.credentials.client_id.is_empty() && !self.credentials.client_secret.is_empty()
    }

    /// URL the user opens in a browser to grant access.
    pub fn build_authorization_url(&self) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&response_type=code&access_type=offline&prompt=consent",
            self.endpoints.auth_url,
            urlencoding::encode(&self.credentials.client_id),
            urlencoding::encode(&self.credentials.redirect_uri),
            urlencoding::encode(&self.credentials.scope),
        )
    }

    pub fn exchange_form(&self, code: &str) -> Result<TokenForm, AuthError> {
        if !self.has_client() {
            return Err(AuthError::MissingClientCredentials);
        }
        let code = code.trim();
        if code.is_empty() {
            return Err(AuthError::EmptyCode);
        }
        Ok(TokenForm {
            grant: GrantType::AuthorizationCode,
            fields: vec![
                ("client_id".to_string(), self.credentials.client_id.clone()),
                ("client_secret".to_string(), self.credentials.client_secret.clone()),
                ("code".to_string(), code.to_string()),
                ("grant_type".to_string(), "authorization_code".to_string()),
                ("redirect_uri".to_string(), self.credentials.redirect_uri.clone()),
            ],
        })
    }

    fn refresh_form(&self) -> Result<TokenForm, AuthError> {
        if !self.tokens.has_refresh_token() {
            return Err(AuthError::NoRefreshToken);
        }
        if !self.has_client() {
            return Err(AuthError::MissingClientCredentials);
        }
        Ok(TokenForm {
            grant: GrantType::RefreshToken,
            fields: vec![
                ("client_id".to_string(), self.credentials.client_id.clone()),
                ("client_secret".to_string(), self.credentials.client_secret.clone()),
                ("refresh_token".to_string(), self.tokens.refresh_token.clone()),
                ("grant_type".to_string(), "refresh_token".to_string()),
            ],
        })
    }

    /// Start a refresh. At most one may be in flight; the token state is not
    /// touched when this fails.
    pub fn begin_refresh(&mut self) -> Result<TokenForm, AuthError> {
        if self.refresh_in_flight {
            return Err(AuthError::RefreshInProgress);
        }
        let form = self.refresh_form()?;
        self.refresh_in_flight = true;
        log::info!("OAuth: refreshing access token");
        Ok(form)
    }

    pub fn apply_exchange(
        &mut self,
        grant: TokenGrant,
        now: DateTime<Utc>,
    ) -> Result<&TokenState, AuthError> {
        if grant.access_token.is_empty() {
            return Err(AuthError::EmptyGrant);
        }
        // Providers may omit the refresh token when one was already issued
        let refresh_token = grant
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.tokens.refresh_token.clone());
        // Any refresh still in flight belongs to the previous grant
        self.refresh_in_flight = false;
        self.tokens = TokenState {
            access_token: grant.access_token,
            refresh_token,
            expiry: grant.expires_in.map(|secs| now + Duration::seconds(secs)),
        };
        self.store.save(&self.tokens)?;
        log::info!(
            "OAuth: authorization complete, access token {}, refresh token {}",
            self.tokens.redacted(),
            if self.tokens.has_refresh_token() { "present" } else { "missing" }
        );
        Ok(&self.tokens)
    }

    /// The refresh token is long-lived; only access token and expiry change.
    /// A grant arriving after the session was cleared is discarded.
    pub fn apply_refresh(&mut self, grant: TokenGrant, now: DateTime<Utc>) -> Result<(), AuthError> {
        if !self.refresh_in_flight {
            return Err(AuthError::NoRefreshPending);
        }
        self.refresh_in_flight = false;
        if grant.access_token.is_empty() {
            return Err(AuthError::EmptyGrant);
        }
        self.tokens.access_token = grant.access_token;
        self.tokens.expiry = grant.expires_in.map(|secs| now + Duration::seconds(secs));
        self.store.save(&self.tokens)?;
        log::info!("OAuth: access token refreshed, now {}", self.tokens.redacted());
        Ok(())
    }

    /// A rejected refresh ends the session.
    pub fn refresh_failed(&mut self) -> Result<(), AuthError> {
        self.refresh_in_flight = false;
        log::warn!("OAuth: refresh rejected, clearing authentication state");
        self.clear()
    }

    pub fn check_freshness(&self, now: DateTime<Utc>) -> Freshness {
        if !self.tokens.is_authenticated() {
            return Freshness::Unauthenticated;
        }
        if !self
            .tokens
            .expires_within(now, Duration::seconds(REFRESH_MARGIN_SECS))
        {
            return Freshness::Fresh;
        }
        if self.tokens.has_refresh_token() {
            Freshness::RefreshDue
        } else if self.tokens.is_expired(now) {
            Freshness::Expired
        } else {
            Freshness::Fresh
        }
    }

    /// Clear tokens and persist the empty state.
    pub fn clear(&mut self) -> Result<(), AuthError> {
        self.refresh_in_flight = false;
        self.tokens.clear();
        self.store.save(&self.tokens)?;
        Ok(())
    }

    pub fn logout(&mut self) -> Result<(), AuthError> {
        log::info!("OAuth: logging out");
        self.clear()
    }

    /// Exchange an authorization code and wait for the result.
    pub async fn exchange_code_for_tokens(
        &mut self,
        client: &DriveClient,
        code: &str,
    ) -> Result<TokenState, AuthError> {
        let form = self.exchange_form(code)?;
        match client.execute(&DriveRequest::AuthExchange { form }, None).await? {
            DriveReply::Tokens(grant) => Ok(self.apply_exchange(grant, Utc::now())?.clone()),
            other => Err(AuthError::Request(DriveError::Malformed(format!(
                "unexpected token reply: {:?}",
                other
            )))),
        }
    }

    /// Refresh the access token and wait for the result.
    pub async fn refresh(&mut self, client: &DriveClient) -> Result<(), AuthError> {
        let form = self.begin_refresh()?;
        match client.execute(&DriveRequest::TokenRefresh { form }, None).await {
            Ok(DriveReply::Tokens(grant)) => self.apply_refresh(grant, Utc::now()),
            Ok(other) => {
                self.refresh_failed()?;
                Err(AuthError::Request(DriveError::Malformed(format!(
                    "unexpected token reply: {:?}",
                    other
                ))))
            }
            Err(e) => {
                self.refresh_failed()?;
                Err(e.into())
            }
        }
    }
}
