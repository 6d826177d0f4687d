//! HashiCorp Vault KV version 2 backend.
//!
//! Secret bytes are stored base64-encoded under the `value` field.

use super::{SecretVault, VaultSecret, validate_secret_name};
use crate::error::{KeyError, KeyResult};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use zeroize::Zeroizing;

/// Connection settings for [`HttpVault`].
#[derive(Clone)]
pub struct HttpVaultSettings {
    /// Base address, e.g. `https://vault.internal:8200`.
    pub address: String,
    pub mount: String,
    pub token: Zeroizing<String>,
    pub namespace: Option<String>,
    pub request_timeout: Duration,
}

pub struct HttpVault {
    client: reqwest::Client,
    base: String,
    mount: String,
    token: Zeroizing<String>,
    namespace: Option<String>,
}

#[derive(Deserialize)]
struct ReadResponse {
    data: ReadData,
}

#[derive(Deserialize)]
struct ReadData {
    data: SecretPayload,
    metadata: VersionMetadata,
}

#[derive(Deserialize)]
struct SecretPayload {
    value: String,
}

#[derive(Deserialize)]
struct VersionMetadata {
    version: u32,
}

#[derive(Deserialize)]
struct WriteResponse {
    data: VersionMetadata,
}

#[derive(Deserialize)]
struct ListResponse {
    data: ListData,
}

#[derive(Deserialize)]
struct ListData {
    keys: Vec<String>,
}

impl HttpVault {
    pub fn new(settings: HttpVaultSettings) -> KeyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| KeyError::Unavailable(format!("build vault client: {e}")))?;
        Ok(Self {
            client,
            base: settings.address.trim_end_matches('/').to_string(),
            mount: settings.mount.trim_matches('/').to_string(),
            token: settings.token,
            namespace: settings.namespace,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}/v1/{}", self.base, path))
            .header("X-Vault-Token", self.token.as_str());
        if let Some(namespace) = &self.namespace {
            builder = builder.header("X-Vault-Namespace", namespace);
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> KeyResult<Response> {
        let response = builder.send().await.map_err(|e| {
            // Connect failures and timeouts are transient.
            KeyError::Unavailable(format!("{what}: {e}"))
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(match status {
            StatusCode::NOT_FOUND => KeyError::NotFound(what.to_string()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                KeyError::Unauthorized(format!("{what}: HTTP {status}"))
            }
            StatusCode::TOO_MANY_REQUESTS => KeyError::Unavailable(format!("{what}: HTTP {status}")),
            s if s.is_server_error() => KeyError::Unavailable(format!("{what}: HTTP {status}")),
            _ => KeyError::InvalidKey(format!("{what}: HTTP {status}")),
        })
    }

    async fn read(&self, name: &str, version: Option<u32>) -> KeyResult<VaultSecret> {
        validate_secret_name(name)?;
        let mut builder = self.request(Method::GET, &format!("{}/data/{}", self.mount, name));
        if let Some(version) = version {
            builder = builder.query(&[("version", version)]);
        }
        let what = match version {
            Some(v) => format!("{name} v{v}"),
            None => name.to_string(),
        };
        let response = self.send(builder, &what).await?;
        let body: ReadResponse = response
            .json()
            .await
            .map_err(|e| KeyError::Unavailable(format!("decode vault response for {what}: {e}")))?;
        let value = Zeroizing::new(body.data.data.value);
        let bytes = STANDARD
            .decode(value.as_bytes())
            .map_err(|e| KeyError::InvalidKey(format!("{what} is not base64: {e}")))?;
        Ok(VaultSecret {
            version: body.data.metadata.version,
            value: Zeroizing::new(bytes),
        })
    }
}

#[async_trait]
impl SecretVault for HttpVault {
    #[tracing::instrument(skip(self), fields(backend = "http"))]
    async fn get_secret(&self, name: &str) -> KeyResult<VaultSecret> {
        self.read(name, None).await
    }

    #[tracing::instrument(skip(self), fields(backend = "http"))]
    async fn get_secret_version(&self, name: &str, version: u32) -> KeyResult<VaultSecret> {
        self.read(name, Some(version)).await
    }

    #[tracing::instrument(skip(self, value), fields(backend = "http"))]
    async fn set_secret(&self, name: &str, value: &[u8]) -> KeyResult<u32> {
        validate_secret_name(name)?;
        let encoded = Zeroizing::new(STANDARD.encode(value));
        let body = serde_json::json!({ "data": { "value": encoded.as_str() } });
        let builder = self
            .request(Method::POST, &format!("{}/data/{}", self.mount, name))
            .json(&body);
        let response = self.send(builder, name).await?;
        let written: WriteResponse = response
            .json()
            .await
            .map_err(|e| KeyError::Unavailable(format!("decode vault write for {name}: {e}")))?;
        Ok(written.data.version)
    }

    #[tracing::instrument(skip(self), fields(backend = "http"))]
    async fn delete_secret(&self, name: &str) -> KeyResult<()> {
        validate_secret_name(name)?;
        // KV v2 deletes metadata idempotently, so existence is checked first.
        self.read(name, None).await?;
        let builder = self.request(Method::DELETE, &format!("{}/metadata/{}", self.mount, name));
        self.send(builder, name).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(backend = "http"))]
    async fn list_secrets(&self) -> KeyResult<Vec<String>> {
        let builder = self
            .request(Method::GET, &format!("{}/metadata/", self.mount))
            .query(&[("list", "true")]);
        let response = match self.send(builder, "secret list").await {
            Ok(response) => response,
            // An empty mount answers 404.
            Err(KeyError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let body: ListResponse = response
            .json()
            .await
            .map_err(|e| KeyError::Unavailable(format!("decode vault list: {e}")))?;
        // Trailing '/' marks a folder, not a secret.
        let mut names: Vec<String> = body
            .data
            .keys
            .into_iter()
            .filter(|k| !k.ends_with('/'))
            .collect();
        names.sort();
        Ok(names)
    }

    fn backend_name(&self) -> &'static str {
        "http"
    }

    async fn health_check(&self) -> KeyResult<()> {
        let builder = self.request(Method::GET, "sys/health");
        self.send(builder, "health").await?;
        Ok(())
    }
}
