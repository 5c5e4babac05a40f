use std::sync::{Arc, RwLock};

use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::core::error::SyncError;

pub const API_KEY_HEADER: &str = "X-API-Key";

/// Bearer token and/or machine API key. Either, both or neither may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
    pub api_key: Option<String>,
}

impl Credentials {
    pub fn new(token: Option<String>, api_key: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.token.is_none() && self.api_key.is_none()
    }
}

/// Source of the credentials attached to each request.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> Credentials;
}

/// Credentials resolved once and never changed.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Credentials);

impl CredentialProvider for StaticCredentials {
    fn credentials(&self) -> Credentials {
        self.0.clone()
    }
}

/// Credentials an external login flow can swap through a [`CredentialRefresh`].
#[derive(Debug, Clone, Default)]
pub struct SharedCredentials {
    inner: Arc<RwLock<Credentials>>,
}

impl SharedCredentials {
    pub fn new(initial: Credentials) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn refresh_handle(&self) -> CredentialRefresh {
        CredentialRefresh {
            inner: self.inner.clone(),
        }
    }
}

impl CredentialProvider for SharedCredentials {
    fn credentials(&self) -> Credentials {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Write side of [`SharedCredentials`], handed to the login flow.
#[derive(Debug, Clone)]
pub struct CredentialRefresh {
    inner: Arc<RwLock<Credentials>>,
}

impl CredentialRefresh {
    pub fn set_token(&self, token: Option<String>) {
        let mut creds = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        creds.token = token.filter(|t| !t.is_empty());
    }

    pub fn set_api_key(&self, api_key: Option<String>) {
        let mut creds = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        creds.api_key = api_key.filter(|k| !k.is_empty());
    }
}

/// Authenticated JSON requests against the dashboard API.
///
/// One attempt per call: any non-2xx answer fails with
/// [`SyncError::Http`]. No timeout is configured here; callers that need a
/// deadline wrap the call themselves.
pub struct Transport {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl Transport {
    pub fn new(
        base_url: impl Into<String>,
        user_agent: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(SyncError::from)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn anonymous(base_url: impl Into<String>) -> Result<Self, SyncError> {
        Self::new(
            base_url,
            concat!("socwatch/", env!("CARGO_PKG_VERSION")),
            Arc::new(StaticCredentials::default()),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, SyncError> {
        self.request(Method::GET, path, None::<&()>).await
    }

    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, SyncError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self.send(method, path, body).await?;
        let bytes = response.bytes().await.map_err(SyncError::from)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            warn!("undecodable response from {}: {}", path, e);
            SyncError::Decode(format!("{}: {}", path, e))
        })
    }

    /// For endpoints that answer without a body (e.g. `204 No Content`).
    pub async fn request_empty<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), SyncError>
    where
        B: Serialize + ?Sized,
    {
        self.send(method, path, body).await?;
        Ok(())
    }

    async fn send<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, SyncError>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, path);

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header(header::CONTENT_TYPE, "application/json");
        let creds = self.credentials.credentials();
        if let Some(token) = creds.token.as_deref() {
            req = req.bearer_auth(token);
        }
        if let Some(key) = creds.api_key.as_deref() {
            req = req.header(API_KEY_HEADER, key);
        }
        if let Some(body) = body {
            req = req.body(serde_json::to_vec(body)?);
        }

        let response = req.send().await.map_err(|e| {
            warn!("{} {} failed: {}", method, path, e);
            SyncError::from(e)
        })?;
        let status = response.status();
        if !status.is_success() {
            warn!("{} {} -> {}", method, path, status);
            return Err(SyncError::Http {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }
        Ok(response)
    }
}
