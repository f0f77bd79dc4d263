use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;

use super::{encode_segment, validate_key, BlobStore, ObjectStoreError};

const API_BASE: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";
/// Refresh this long before the token's reported expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Google Cloud Storage blob store.
///
/// GCS objects are immutable, so `append` uploads the chunk as a part object
/// and composes it onto the end of the target, and `rename` is a server-side
/// rewrite followed by a delete of the source.
pub struct GcsStore {
    bucket: String,
    client: Client,
    access_token: tokio::sync::RwLock<CachedToken>,
    credentials_file: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + TOKEN_REFRESH_MARGIN < self.expires_at
    }
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

impl TokenResponse {
    fn into_cached(self, now: Instant) -> CachedToken {
        CachedToken {
            value: self.access_token,
            expires_at: now + Duration::from_secs(self.expires_in),
        }
    }
}

#[derive(Deserialize)]
struct ObjectMetadata {
    /// GCS reports sizes as decimal strings.
    size: String,
}

impl GcsStore {
    pub async fn new(bucket: &str, credentials_file: Option<&str>) -> Result<Self, anyhow::Error> {
        let client = Client::builder().build()?;
        let credentials_file = credentials_file.map(|s| s.to_string());
        let token = fetch_token(&client, credentials_file.as_deref()).await?;

        Ok(Self {
            bucket: bucket.to_string(),
            client,
            access_token: tokio::sync::RwLock::new(token),
            credentials_file,
        })
    }

    /// Current access token, refreshed when close to expiry.
    async fn token(&self) -> Result<String, ObjectStoreError> {
        {
            let cached = self.access_token.read().await;
            if cached.is_fresh(Instant::now()) {
                return Ok(cached.value.clone());
            }
        }

        let mut cached = self.access_token.write().await;
        // Another caller may have refreshed while we waited
        if !cached.is_fresh(Instant::now()) {
            *cached = fetch_token(&self.client, self.credentials_file.as_deref())
                .await
                .map_err(|e| ObjectStoreError::Backend(format!("GCS token refresh failed: {e}")))?;
            tracing::debug!("Refreshed GCS access token");
        }
        Ok(cached.value.clone())
    }

    fn upload_url(&self, key: &str) -> String {
        format!(
            "{UPLOAD_BASE}/b/{}/o?uploadType=media&name={}",
            self.bucket,
            encode_segment(key)
        )
    }

    fn object_url(&self, key: &str) -> String {
        format!("{API_BASE}/b/{}/o/{}", self.bucket, encode_segment(key))
    }

    fn compose_url(&self, key: &str) -> String {
        format!("{}/compose", self.object_url(key))
    }

    fn rewrite_url(&self, from: &str, to: &str) -> String {
        format!(
            "{}/rewriteTo/b/{}/o/{}",
            self.object_url(from),
            self.bucket,
            encode_segment(to)
        )
    }

    async fn check(resp: reqwest::Response, action: &str) -> Result<(), ObjectStoreError> {
        if resp.status().is_success() {
            return Ok(());
        }
        Err(Self::failure(resp, action).await)
    }

    async fn failure(resp: reqwest::Response, action: &str) -> ObjectStoreError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        ObjectStoreError::Backend(format!("GCS {action} failed ({status}): {body}"))
    }
}

#[async_trait]
impl BlobStore for GcsStore {
    async fn write(&self, key: &str, data: Bytes) -> Result<u64, ObjectStoreError> {
        validate_key(key)?;
        let len = data.len() as u64;
        let resp = self
            .client
            .post(self.upload_url(key))
            .bearer_auth(self.token().await?)
            .header("Content-Type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        Self::check(resp, "upload").await?;
        Ok(len)
    }

    async fn append(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        validate_key(key)?;
        if self.size(key).await?.is_none() {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }

        let token = self.token().await?;
        let part = format!("{key}.part-{}", uuid::Uuid::new_v4());
        self.write(&part, data).await?;

        let body = serde_json::json!({
            "sourceObjects": [{ "name": key }, { "name": part }],
            "destination": { "contentType": "application/octet-stream" },
        });
        let result = self
            .client
            .post(self.compose_url(key))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()));

        let composed = match result {
            Ok(resp) => Self::check(resp, "compose").await,
            Err(e) => Err(e),
        };

        if let Err(e) = self.delete(&part).await {
            tracing::warn!(part = %part, error = %e, "Failed to delete GCS part object");
        }
        composed
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ObjectStoreError> {
        validate_key(from)?;
        validate_key(to)?;

        // Large objects may need several rewrite calls
        let mut rewrite_token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .post(self.rewrite_url(from, to))
                .bearer_auth(self.token().await?)
                .json(&serde_json::json!({}));
            if let Some(ref t) = rewrite_token {
                req = req.query(&[("rewriteToken", t.as_str())]);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(ObjectStoreError::NotFound(from.to_string()));
            }
            if !resp.status().is_success() {
                return Err(Self::failure(resp, "rewrite").await);
            }

            let body: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
            if body.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
                break;
            }
            rewrite_token = body
                .get("rewriteToken")
                .and_then(|t| t.as_str())
                .map(|t| t.to_string());
            if rewrite_token.is_none() {
                return Err(ObjectStoreError::Backend(
                    "GCS rewrite returned neither done nor rewriteToken".to_string(),
                ));
            }
        }

        self.delete(from).await
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        validate_key(key)?;
        let resp = self
            .client
            .delete(self.object_url(key))
            .bearer_auth(self.token().await?)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        // 404 is fine -- object already gone
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(resp, "delete").await
    }

    async fn size(&self, key: &str) -> Result<Option<u64>, ObjectStoreError> {
        validate_key(key)?;
        let resp = self
            .client
            .get(self.object_url(key))
            .bearer_auth(self.token().await?)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::failure(resp, "metadata").await);
        }

        let meta: ObjectMetadata = resp
            .json()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        meta.size
            .parse()
            .map(Some)
            .map_err(|_| ObjectStoreError::Backend(format!("invalid object size '{}'", meta.size)))
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        validate_key(key)?;
        self.download(key, None).await
    }

    /// Objects are immutable, so truncation rewrites the retained prefix.
    async fn truncate(&self, key: &str, len: u64) -> Result<(), ObjectStoreError> {
        validate_key(key)?;
        let current = self
            .size(key)
            .await?
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?;
        if current == len {
            return Ok(());
        }
        if current < len {
            return Err(ObjectStoreError::Backend(format!(
                "cannot truncate {key} from {current} up to {len} bytes"
            )));
        }

        let prefix = if len == 0 {
            Bytes::new()
        } else {
            self.download(key, Some(len)).await?
        };
        if prefix.len() as u64 != len {
            return Err(ObjectStoreError::Backend(format!(
                "GCS range read of {key} returned {} bytes, wanted {len}",
                prefix.len()
            )));
        }
        self.write(key, prefix).await?;
        Ok(())
    }
}

impl GcsStore {
    /// Fetch object bytes, optionally only the first `limit` bytes.
    async fn download(&self, key: &str, limit: Option<u64>) -> Result<Bytes, ObjectStoreError> {
        let mut req = self
            .client
            .get(self.object_url(key))
            .query(&[("alt", "media")])
            .bearer_auth(self.token().await?);
        if let Some(limit) = limit {
            req = req.header("Range", format!("bytes=0-{}", limit - 1));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }
        if !resp.status().is_success() {
            return Err(Self::failure(resp, "download").await);
        }

        resp.bytes()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))
    }
}

async fn fetch_token(
    client: &Client,
    credentials_file: Option<&str>,
) -> Result<CachedToken, anyhow::Error> {
    let now = Instant::now();
    let resp = match credentials_file {
        Some(path) => token_from_service_account(client, path).await?,
        None => token_from_metadata_server(client).await?,
    };
    Ok(resp.into_cached(now))
}

async fn token_from_service_account(
    client: &Client,
    path: &str,
) -> Result<TokenResponse, anyhow::Error> {
    let key_json = tokio::fs::read_to_string(path).await?;
    let key: ServiceAccountKey = serde_json::from_str(&key_json)?;

    let now = chrono::Utc::now().timestamp();
    let claims = serde_json::json!({
        "iss": key.client_email,
        "scope": "https://www.googleapis.com/auth/devstorage.read_write",
        "aud": key.token_uri,
        "iat": now,
        "exp": now + 3600,
    });

    let header = base64_url_encode(&serde_json::to_vec(&serde_json::json!({
        "alg": "RS256",
        "typ": "JWT"
    }))?);
    let payload = base64_url_encode(&serde_json::to_vec(&claims)?);
    let unsigned = format!("{header}.{payload}");

    let signature = sign_rs256(unsigned.as_bytes(), &key.private_key)?;
    let jwt = format!("{unsigned}.{}", base64_url_encode(&signature));

    let resp: TokenResponse = client
        .post(&key.token_uri)
        .form(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", &jwt),
        ])
        .send()
        .await?
        .json()
        .await?;

    Ok(resp)
}

async fn token_from_metadata_server(client: &Client) -> Result<TokenResponse, anyhow::Error> {
    let resp: TokenResponse = client
        .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
        .header("Metadata-Flavor", "Google")
        .send()
        .await?
        .json()
        .await?;

    Ok(resp)
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn sign_rs256(data: &[u8], private_key_pem: &str) -> Result<Vec<u8>, anyhow::Error> {
    // Strip PEM headers and decode base64
    let der_b64: String = private_key_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &der_b64)?;

    let key_pair = ring::signature::RsaKeyPair::from_pkcs8(&der)
        .map_err(|e| anyhow::anyhow!("Failed to parse RSA key: {e}"))?;

    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &ring::signature::RSA_PKCS1_SHA256,
            &ring::rand::SystemRandom::new(),
            data,
            &mut signature,
        )
        .map_err(|e| anyhow::anyhow!("Failed to sign: {e}"))?;

    Ok(signature)
}
