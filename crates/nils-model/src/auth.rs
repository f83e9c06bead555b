// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OAuth credential store (`auth.json`).
//!
//! The runtime treats credential refresh as an external concern: the store
//! persists per-provider credentials, and [`get_oauth_api_key`] returns the
//! usable key, invoking the caller-supplied refresh hook when the stored
//! access token has expired. API-key-only providers simply never set
//! `expires_at`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|t| t <= Utc::now()).unwrap_or(false)
    }
}

/// File-backed credential store, one entry per provider.
pub struct CredentialStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, Credential>>,
}

impl CredentialStore {
    pub fn load(path: &Path) -> Self {
        let entries = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        }
    }

    pub async fn get(&self, provider: &str) -> Option<Credential> {
        self.entries.lock().await.get(provider).cloned()
    }

    /// Store a credential and persist the whole file (temp + rename).
    pub async fn put(&self, provider: &str, credential: Credential) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(provider.to_string(), credential);
        let text = serde_json::to_string_pretty(&*entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Resolve the API key for `provider`, refreshing through `refresh` when the
/// stored credential has expired. A refreshed credential is written back to
/// the store before the key is returned.
pub async fn get_oauth_api_key<F, Fut>(
    provider: &str,
    store: &CredentialStore,
    refresh: F,
) -> anyhow::Result<Option<String>>
where
    F: FnOnce(Credential) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<Credential>>,
{
    let Some(credential) = store.get(provider).await else {
        return Ok(None);
    };
    if !credential.is_expired() {
        return Ok(Some(credential.access_token));
    }
    debug!(provider, "stored credential expired; refreshing");
    let refreshed = refresh(credential).await?;
    let key = refreshed.access_token.clone();
    store.put(provider, refreshed).await?;
    Ok(Some(key))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(token: &str, expires_at: Option<DateTime<Utc>>) -> Credential {
        Credential {
            access_token: token.into(),
            refresh_token: Some("r".into()),
            expires_at,
        }
    }

    #[tokio::test]
    async fn missing_file_yields_empty_store() {
        let store = CredentialStore::load(Path::new("/tmp/nils_auth_missing.json"));
        assert!(store.get("anthropic").await.is_none());
    }

    #[tokio::test]
    async fn put_then_get_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("auth.json");
        let store = CredentialStore::load(&path);
        store.put("anthropic", cred("tok-1", None)).await.unwrap();

        let reloaded = CredentialStore::load(&path);
        let c = reloaded.get("anthropic").await.unwrap();
        assert_eq!(c.access_token, "tok-1");
    }

    #[tokio::test]
    async fn fresh_credential_is_returned_without_refresh() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(&tmp.path().join("auth.json"));
        let future = Utc::now() + chrono::Duration::hours(1);
        store.put("p", cred("fresh", Some(future))).await.unwrap();

        let key = get_oauth_api_key("p", &store, |_| async {
            panic!("refresh must not be called for a fresh credential")
        })
        .await
        .unwrap();
        assert_eq!(key.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn expired_credential_is_refreshed_and_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("auth.json");
        let store = CredentialStore::load(&path);
        let past = Utc::now() - chrono::Duration::hours(1);
        store.put("p", cred("stale", Some(past))).await.unwrap();

        let key = get_oauth_api_key("p", &store, |old| async move {
            assert_eq!(old.access_token, "stale");
            Ok(cred("renewed", Some(Utc::now() + chrono::Duration::hours(1))))
        })
        .await
        .unwrap();
        assert_eq!(key.as_deref(), Some("renewed"));
        assert_eq!(store.get("p").await.unwrap().access_token, "renewed");
    }

    #[tokio::test]
    async fn unknown_provider_is_none_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(&tmp.path().join("auth.json"));
        let key = get_oauth_api_key("nope", &store, |c| async move { Ok(c) })
            .await
            .unwrap();
        assert!(key.is_none());
    }
}
