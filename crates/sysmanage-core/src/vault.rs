//! External vault client (KV v2).
//!
//! Secret content never touches the relational store; rows only reference a
//! vault path plus a scoped token. Payload shape follows the KV v2 contract:
//! `{data: {data: {content: "<secret>"}}}` on read, `{data: {content}}` on
//! write. All calls carry a 30 s timeout; failures surface to callers as
//! `dependency_failed`.

use std::time::Duration;

use serde_json::json;
use tracing::warn;

use crate::error::VaultError;

const VAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the external KV v2 vault.
pub struct VaultClient {
    http: reqwest::Client,
    base_url: String,
    mount: String,
}

impl VaultClient {
    /// Create a client for the vault at `base_url` using the given KV mount.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Request`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, mount: &str) -> Result<Self, VaultError> {
        let http = reqwest::Client::builder()
            .timeout(VAULT_TIMEOUT)
            .build()
            .map_err(|e| VaultError::Request {
                reason: e.to_string(),
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            mount: mount.trim_matches('/').to_owned(),
        })
    }

    fn data_url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}/data/{}",
            self.base_url,
            self.mount,
            path.trim_start_matches('/')
        )
    }

    /// Store secret content at a path.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Request`] if the vault rejects the write.
    pub async fn store_secret(
        &self,
        path: &str,
        token: &str,
        content: &str,
    ) -> Result<(), VaultError> {
        let body = json!({"data": {"content": content}});
        let response = self
            .http
            .post(self.data_url(path))
            .header("X-Vault-Token", token)
            .json(&body)
            .send()
            .await
            .map_err(|e| VaultError::Request {
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(VaultError::Request {
                reason: format!("vault returned {} storing '{path}'", response.status()),
            });
        }
        Ok(())
    }

    /// Retrieve secret content from a path.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] for a missing secret,
    /// [`VaultError::Malformed`] if the response lacks the KV v2 shape.
    pub async fn retrieve_secret(&self, path: &str, token: &str) -> Result<String, VaultError> {
        let response = self
            .http
            .get(self.data_url(path))
            .header("X-Vault-Token", token)
            .send()
            .await
            .map_err(|e| VaultError::Request {
                reason: e.to_string(),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(VaultError::NotFound {
                path: path.to_owned(),
            });
        }
        if !response.status().is_success() {
            return Err(VaultError::Request {
                reason: format!("vault returned {} reading '{path}'", response.status()),
            });
        }

        let body: serde_json::Value = response.json().await.map_err(|e| VaultError::Request {
            reason: e.to_string(),
        })?;

        body.get("data")
            .and_then(|d| d.get("data"))
            .and_then(|d| d.get("content"))
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| VaultError::Malformed {
                path: path.to_owned(),
            })
    }

    /// Delete the secret at a path. Callers keep the referencing DB row when
    /// this fails, so vault content is never orphaned.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Request`] if the vault rejects the delete.
    pub async fn delete_secret(&self, path: &str, token: &str) -> Result<(), VaultError> {
        let url = format!(
            "{}/v1/{}/metadata/{}",
            self.base_url,
            self.mount,
            path.trim_start_matches('/')
        );
        let response = self
            .http
            .delete(url)
            .header("X-Vault-Token", token)
            .send()
            .await
            .map_err(|e| VaultError::Request {
                reason: e.to_string(),
            })?;

        // A secret already gone is a successful delete.
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            warn!(path, status = %response.status(), "vault delete failed");
            return Err(VaultError::Request {
                reason: format!("vault returned {} deleting '{path}'", response.status()),
            });
        }
        Ok(())
    }

    /// Liveness probe against the vault's health endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Request`] if the vault is unreachable.
    pub async fn health(&self) -> Result<(), VaultError> {
        let url = format!("{}/v1/sys/health", self.base_url);
        self.http
            .get(url)
            .send()
            .await
            .map_err(|e| VaultError::Request {
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("base_url", &self.base_url)
            .field("mount", &self.mount)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn data_urls_are_kv_v2_shaped() {
        let client = VaultClient::new("http://127.0.0.1:8200/", "secret").unwrap();
        assert_eq!(
            client.data_url("sysmanage/api-keys/grafana"),
            "http://127.0.0.1:8200/v1/secret/data/sysmanage/api-keys/grafana"
        );
    }
}
