//! OCI distribution client: digest resolution, image manifests, blobs.
//!
//! Policy checks (host allowlist, scheme) run before any HTTP call.
//! 429 and 5xx are retried with exponential backoff, bounded; 4xx are not.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use crate::config::RegistryConfig;
use crate::error::{CpmError, OciError, Result};
use crate::hash::sha256_hex;
use crate::oci::reference::PacketRef;

/// Annotation carrying the packet-relative file name of a layer.
pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json";

/// One content descriptor in an image manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OciDescriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl OciDescriptor {
    /// The layer's file name from the title annotation, if present.
    pub fn title(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(TITLE_ANNOTATION))
            .map(String::as_str)
    }
}

/// An OCI image manifest, reduced to the fields CPM consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OciImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<OciDescriptor>,
    pub layers: Vec<OciDescriptor>,
}

/// Registry operations the resolver depends on. The HTTP implementation is
/// below; tests substitute an in-memory registry with request counters.
pub trait RegistryClient {
    /// Resolve an alias/tag to a manifest digest (one round trip).
    fn resolve_digest(
        &self,
        packet_ref: &PacketRef,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Fetch the image manifest for a digest or tag.
    fn fetch_manifest(
        &self,
        packet_ref: &PacketRef,
        reference: &str,
    ) -> impl Future<Output = Result<OciImageManifest>> + Send;

    /// Fetch one blob, verified against its digest.
    fn fetch_blob(
        &self,
        packet_ref: &PacketRef,
        digest: &str,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// reqwest-backed registry client.
pub struct HttpRegistryClient {
    client: reqwest::Client,
    config: RegistryConfig,
}

impl HttpRegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CpmError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Base URL for a host after the policy gate: allowlist membership and
    /// https (plain http only for explicitly allowed hosts).
    fn base_url(&self, host: &str) -> Result<String> {
        let bare_host = host.split(':').next().unwrap_or(host);
        if !self.config.allowed_hosts.is_empty()
            && !self.config.allowed_hosts.iter().any(|h| h == host || h == bare_host)
        {
            return Err(CpmError::Oci(OciError::PolicyDenied(format!(
                "host {} is not in the allowlist",
                host
            ))));
        }
        let scheme = if self
            .config
            .allow_http_hosts
            .iter()
            .any(|h| h == host || h == bare_host)
        {
            "http"
        } else {
            "https"
        };
        Ok(format!("{}://{}", scheme, host))
    }

    fn manifest_url(&self, packet_ref: &PacketRef, reference: &str) -> Result<String> {
        Ok(format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(&packet_ref.host)?,
            packet_ref.repository(),
            reference
        ))
    }

    fn blob_url(&self, packet_ref: &PacketRef, digest: &str) -> Result<String> {
        Ok(format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(&packet_ref.host)?,
            packet_ref.repository(),
            digest
        ))
    }

    /// Run `op` with bounded backoff on retryable registry errors.
    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0usize;
        let mut delay = Duration::from_millis(500);
        loop {
            match op().await {
                Err(CpmError::Oci(e)) if e.is_retryable() && attempt < 2 => {
                    log::warn!("registry retry {}/2 after: {}", attempt + 1, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Map an HTTP status to the OCI failure taxonomy.
fn map_status(status: reqwest::StatusCode, what: &str) -> CpmError {
    let err = match status.as_u16() {
        404 => OciError::NotFound(what.to_string()),
        401 | 403 => OciError::AuthRequired(what.to_string()),
        429 => OciError::RateLimited,
        code if code >= 500 => OciError::UpstreamUnavailable(format!("{} ({})", what, code)),
        code => OciError::Protocol(format!("{} returned unexpected status {}", what, code)),
    };
    CpmError::Oci(err)
}

fn transport_error(e: reqwest::Error, what: &str) -> CpmError {
    // Timeouts and connection failures are upstream conditions.
    CpmError::Oci(OciError::UpstreamUnavailable(format!("{}: {}", what, e)))
}

impl RegistryClient for HttpRegistryClient {
    async fn resolve_digest(&self, packet_ref: &PacketRef) -> Result<String> {
        if let Some(digest) = packet_ref.digest() {
            return Ok(digest.to_string());
        }
        let url = self.manifest_url(packet_ref, packet_ref.reference_str())?;
        let what = format!("{}:{}", packet_ref.repository(), packet_ref.reference_str());

        self.with_retries(|| async {
            let response = self
                .client
                .head(&url)
                .header("Accept", MANIFEST_ACCEPT)
                .send()
                .await
                .map_err(|e| transport_error(e, &what))?;
            if !response.status().is_success() {
                return Err(map_status(response.status(), &what));
            }
            match response
                .headers()
                .get("Docker-Content-Digest")
                .and_then(|v| v.to_str().ok())
            {
                Some(digest) => Ok(digest.to_string()),
                None => {
                    // Registry did not advertise the digest; hash the
                    // manifest body instead.
                    let response = self
                        .client
                        .get(&url)
                        .header("Accept", MANIFEST_ACCEPT)
                        .send()
                        .await
                        .map_err(|e| transport_error(e, &what))?;
                    if !response.status().is_success() {
                        return Err(map_status(response.status(), &what));
                    }
                    let bytes = response.bytes().await.map_err(|e| transport_error(e, &what))?;
                    Ok(format!("sha256:{}", sha256_hex(&bytes)))
                }
            }
        })
        .await
    }

    async fn fetch_manifest(
        &self,
        packet_ref: &PacketRef,
        reference: &str,
    ) -> Result<OciImageManifest> {
        let url = self.manifest_url(packet_ref, reference)?;
        let what = format!("manifest {}@{}", packet_ref.repository(), reference);

        self.with_retries(|| async {
            let response = self
                .client
                .get(&url)
                .header("Accept", MANIFEST_ACCEPT)
                .send()
                .await
                .map_err(|e| transport_error(e, &what))?;
            if !response.status().is_success() {
                return Err(map_status(response.status(), &what));
            }
            response
                .json::<OciImageManifest>()
                .await
                .map_err(|e| CpmError::Oci(OciError::Protocol(format!("{}: {}", what, e))))
        })
        .await
    }

    async fn fetch_blob(&self, packet_ref: &PacketRef, digest: &str) -> Result<Vec<u8>> {
        let url = self.blob_url(packet_ref, digest)?;
        let what = format!("blob {}", digest);

        let bytes = self
            .with_retries(|| async {
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| transport_error(e, &what))?;
                if !response.status().is_success() {
                    return Err(map_status(response.status(), &what));
                }
                response
                    .bytes()
                    .await
                    .map(|b| b.to_vec())
                    .map_err(|e| transport_error(e, &what))
            })
            .await?;

        let actual = format!("sha256:{}", sha256_hex(&bytes));
        if actual != digest {
            return Err(CpmError::Oci(OciError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            }));
        }
        Ok(bytes)
    }
}
