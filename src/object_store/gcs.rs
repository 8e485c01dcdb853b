use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;

use super::{ByteStream, ObjectStore, ObjectStoreError};
use crate::storage::models::StorageType;

const STORAGE_HOST: &str = "storage.googleapis.com";
/// Longest V4 signed URL lifetime GCS accepts (7 days).
const MAX_SIGNED_SECS: u64 = 7 * 24 * 3600;
/// Refresh tokens this long before they expire.
const TOKEN_SLACK_SECS: i64 = 60;
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Google Cloud Storage, the managed object store backend.
pub struct GcsStore {
    bucket: String,
    client: Client,
    access_token: tokio::sync::RwLock<CachedToken>,
    service_account: Option<ServiceAccountKey>,
}

#[derive(Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Default)]
struct CachedToken {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at
            .map(|at| at - chrono::Duration::seconds(TOKEN_SLACK_SECS) > Utc::now())
            .unwrap_or(false)
    }
}

impl GcsStore {
    pub async fn new(
        bucket: &str,
        credentials_file: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let client = Client::builder().timeout(timeout).build()?;

        let service_account = match credentials_file {
            Some(path) => {
                let key_json = tokio::fs::read_to_string(path).await?;
                Some(serde_json::from_str::<ServiceAccountKey>(&key_json)?)
            }
            None => None,
        };

        let store = Self {
            bucket: bucket.to_string(),
            client,
            access_token: tokio::sync::RwLock::new(CachedToken::default()),
            service_account,
        };

        store.token().await?;
        Ok(store)
    }

    /// A valid bearer token, refreshed when close to expiry.
    async fn token(&self) -> Result<String, anyhow::Error> {
        {
            let cached = self.access_token.read().await;
            if cached.is_fresh() {
                return Ok(cached.value.clone());
            }
        }

        let mut lock = self.access_token.write().await;
        if lock.is_fresh() {
            return Ok(lock.value.clone());
        }
        let resp = match self.service_account {
            Some(ref key) => self.token_from_service_account(key).await?,
            None => self.token_from_metadata_server().await?,
        };
        lock.value = resp.access_token;
        lock.expires_at = Some(Utc::now() + chrono::Duration::seconds(resp.expires_in));
        Ok(lock.value.clone())
    }

    async fn bearer(&self) -> Result<String, ObjectStoreError> {
        self.token()
            .await
            .map_err(|e| ObjectStoreError::Backend(format!("GCS token refresh failed: {e}")))
    }

    async fn token_from_service_account(
        &self,
        key: &ServiceAccountKey,
    ) -> Result<TokenResponse, anyhow::Error> {
        let now = Utc::now().timestamp();
        let claims = serde_json::json!({
            "iss": key.client_email,
            "scope": "https://www.googleapis.com/auth/devstorage.read_write",
            "aud": key.token_uri,
            "iat": now,
            "exp": now + 3600,
        });

        // Build JWT (header.claims.signature)
        let header = base64_url_encode(&serde_json::to_vec(&serde_json::json!({
            "alg": "RS256",
            "typ": "JWT"
        }))?);
        let payload = base64_url_encode(&serde_json::to_vec(&claims)?);
        let unsigned = format!("{header}.{payload}");

        let signature = sign_rs256(unsigned.as_bytes(), &key.private_key)?;
        let jwt = format!("{unsigned}.{}", base64_url_encode(&signature));

        let resp: TokenResponse = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp)
    }

    async fn token_from_metadata_server(&self) -> Result<TokenResponse, anyhow::Error> {
        let resp: TokenResponse = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp)
    }

    fn upload_url(&self, key: &str) -> String {
        format!(
            "https://{STORAGE_HOST}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.bucket,
            encode_component(key)
        )
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "https://{STORAGE_HOST}/storage/v1/b/{}/o/{}",
            self.bucket,
            encode_component(key)
        )
    }

    async fn failure(resp: reqwest::Response, what: &str) -> ObjectStoreError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        ObjectStoreError::Backend(format!("GCS {what} failed ({status}): {body}"))
    }

    async fn upload(
        &self,
        key: &str,
        body: reqwest::Body,
        len: u64,
    ) -> Result<(), ObjectStoreError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .post(self.upload_url(key))
            .bearer_auth(&token)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", len)
            .body(body)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::failure(resp, "upload").await);
        }
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<reqwest::Response, ObjectStoreError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .get(format!("{}?alt=media", self.object_url(key)))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }
        if !resp.status().is_success() {
            return Err(Self::failure(resp, "download").await);
        }
        Ok(resp)
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    fn storage_type(&self) -> StorageType {
        StorageType::ManagedObjectStore
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        let len = data.len() as u64;
        self.upload(key, reqwest::Body::from(data), len).await
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), ObjectStoreError> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        self.upload(key, reqwest::Body::wrap_stream(ReaderStream::new(file)), len)
            .await
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.download(key)
            .await?
            .bytes()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))
    }

    async fn get_stream(&self, key: &str) -> Result<ByteStream, ObjectStoreError> {
        let resp = self.download(key).await?;
        Ok(Box::pin(
            resp.bytes_stream()
                .map_err(|e| ObjectStoreError::Backend(e.to_string())),
        ))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .delete(self.object_url(key))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        // 404 is fine -- object already gone
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(Self::failure(resp, "delete").await);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .get(self.object_url(key))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(ObjectStoreError::Backend(format!("GCS metadata failed ({s})"))),
        }
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, ObjectStoreError> {
        let Some(ref account) = self.service_account else {
            return Err(ObjectStoreError::Unsupported(
                "GCS signed URLs require service account credentials".to_string(),
            ));
        };
        let expires = ttl.as_secs().clamp(1, MAX_SIGNED_SECS);
        v4_signed_url(account, &self.bucket, key, expires, Utc::now())
            .map_err(|e| ObjectStoreError::Backend(format!("GCS URL signing failed: {e}")))
    }
}

/// Percent-encode an object name as a single URL component (`/` included).
fn encode_component(key: &str) -> String {
    utf8_percent_encode(key, NON_ALPHANUMERIC).to_string()
}

/// Path segments keep their `/` separators in V4 signed URLs.
fn encode_object_path(key: &str) -> String {
    key.split('/')
        .map(|segment| {
            percent_encoding::utf8_percent_encode(segment, UNRESERVED_SET).to_string()
        })
        .collect::<Vec<_>>()
        .join("/")
}

const UNRESERVED_SET: &percent_encoding::AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn v4_signed_url(
    account: &ServiceAccountKey,
    bucket: &str,
    key: &str,
    expires_secs: u64,
    now: DateTime<Utc>,
) -> Result<String, anyhow::Error> {
    let date = now.format("%Y%m%d").to_string();
    let datetime = now.format("%Y%m%dT%H%M%SZ").to_string();
    let scope = format!("{date}/auto/storage/goog4_request");
    let credential = format!("{}/{scope}", account.client_email);

    let path = format!("/{bucket}/{}", encode_object_path(key));
    let mut params = [
        ("X-Goog-Algorithm", "GOOG4-RSA-SHA256".to_string()),
        ("X-Goog-Credential", credential),
        ("X-Goog-Date", datetime.clone()),
        ("X-Goog-Expires", expires_secs.to_string()),
        ("X-Goog-SignedHeaders", "host".to_string()),
    ];
    params.sort_by(|a, b| a.0.cmp(b.0));
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={}", utf8_percent_encode(v, UNRESERVED_SET)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request =
        format!("GET\n{path}\n{query}\nhost:{STORAGE_HOST}\n\nhost\nUNSIGNED-PAYLOAD");
    let digest = ring::digest::digest(&ring::digest::SHA256, canonical_request.as_bytes());
    let string_to_sign = format!(
        "GOOG4-RSA-SHA256\n{datetime}\n{scope}\n{}",
        hex::encode(digest)
    );

    let signature = sign_rs256(string_to_sign.as_bytes(), &account.private_key)?;
    Ok(format!(
        "https://{STORAGE_HOST}{path}?{query}&X-Goog-Signature={}",
        hex::encode(signature)
    ))
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
    let der = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, der_b64.trim())?;

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
