//! Credential handling.
//!
//! Token acquisition is delegated to an [`AuthProvider`]; the client only
//! decides when to ask for a fresh token and which query parameters to put on
//! a transport URI.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ErrorInfo, codes};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDetails {
    pub token: String,
    pub client_id: Option<String>,
    /// Milliseconds since the epoch.
    pub expires: Option<i64>,
}

impl TokenDetails {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client_id: None,
            expires: None,
        }
    }
}

/// Parameters handed to a provider, mainly so it can mint a token for the right client.
#[derive(Debug, Clone, Default)]
pub struct TokenParams {
    pub client_id: Option<String>,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn request_token(&self, params: TokenParams) -> Result<TokenDetails, ErrorInfo>;
}

/// Hands out one static token; used for `REALTIME_TOKEN`.
pub struct StaticToken(pub String);

#[async_trait]
impl AuthProvider for StaticToken {
    async fn request_token(&self, params: TokenParams) -> Result<TokenDetails, ErrorInfo> {
        Ok(TokenDetails {
            token: self.0.clone(),
            client_id: params.client_id,
            expires: None,
        })
    }
}

#[derive(Clone)]
enum Method {
    Basic { key: String },
    Token { provider: Arc<dyn AuthProvider> },
}

/// Shared between the engine and the credential-fetch tasks it spawns.
#[derive(Clone)]
pub struct Auth {
    method: Method,
    client_id: Option<String>,
    current: Arc<Mutex<Option<TokenDetails>>>,
}

impl Auth {
    pub fn basic(key: impl Into<String>, client_id: Option<String>) -> Self {
        Self {
            method: Method::Basic { key: key.into() },
            client_id,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn token(provider: Arc<dyn AuthProvider>, client_id: Option<String>) -> Self {
        Self {
            method: Method::Token { provider },
            client_id,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_basic(&self) -> bool {
        matches!(self.method, Method::Basic { .. })
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn current_token(&self) -> Option<String> {
        self.current.lock().as_ref().map(|t| t.token.clone())
    }

    /// Query parameters authenticating a transport.
    pub fn auth_params(&self) -> Vec<(String, String)> {
        match &self.method {
            Method::Basic { key } => vec![("key".into(), key.clone())],
            Method::Token { .. } => self
                .current_token()
                .map(|token| vec![("access_token".into(), token)])
                .unwrap_or_default(),
        }
    }

    /// Returns a usable token, asking the provider when none is held or when `force` is set.
    ///
    /// Basic auth needs no token and resolves immediately.
    pub async fn authorize(&self, force: bool) -> Result<Option<TokenDetails>, ErrorInfo> {
        let Method::Token { provider } = &self.method else {
            return Ok(None);
        };
        if !force {
            if let Some(existing) = self.current.lock().clone() {
                return Ok(Some(existing));
            }
        }
        let params = TokenParams {
            client_id: self.client_id.clone(),
        };
        let details = provider.request_token(params).await?;
        if let (Some(configured), Some(issued)) = (&self.client_id, &details.client_id) {
            if configured != issued && issued != "*" {
                return Err(ErrorInfo::new(
                    format!(
                        "Mismatched clientId for existing client: token has {issued}, client has {configured}"
                    ),
                    codes::INCOMPATIBLE_CLIENT_ID,
                    401,
                ));
            }
        }
        *self.current.lock() = Some(details.clone());
        Ok(Some(details))
    }

    /// Drops a token the server rejected.
    pub fn invalidate(&self) {
        self.current.lock().take();
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let method = match self.method {
            Method::Basic { .. } => "basic",
            Method::Token { .. } => "token",
        };
        f.debug_struct("Auth")
            .field("method", &method)
            .field("client_id", &self.client_id)
            .finish()
    }
}
