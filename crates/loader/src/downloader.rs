//! HTTP downloads of manifests and asset files.

use crate::error::{LoaderError, LoaderResult};
use crate::key_source::HttpKeySource;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::instrument;
use updraft_core::{
    ContentHash, MAX_FATAL_ERROR_LEN, ManifestAsset, ManifestExtensions, ManifestFilters,
    PROTOCOL_VERSION, SignedEnvelope, UpdateDirective, UpdateManifest, UpdatesConfig,
    asset_relative_path,
};
use updraft_signer::SignatureVerifier;
use updraft_storage::ObjectStore;
use uuid::Uuid;

/// Response header carrying headers to echo on later manifest requests.
pub const SERVER_DEFINED_HEADERS_HEADER: &str = "updraft-server-defined-headers";

/// Response header carrying the manifest filters for this scope.
pub const MANIFEST_FILTERS_HEADER: &str = "updraft-manifest-filters";

/// Response types accepted for manifest requests, most preferred first.
const MANIFEST_ACCEPT: &str = "multipart/mixed,application/json";

/// Whole-request retries after the first attempt.
const MAX_RETRIES: u32 = 1;

/// Sends a request, retrying once on transport errors and 5xx responses.
///
/// The last response is returned as-is, so a server that keeps failing
/// surfaces its final status to the caller.
pub(crate) async fn retry_request<F, Fut>(mut make_request: F) -> reqwest::Result<reqwest::Response>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = reqwest::Result<reqwest::Response>>,
{
    let mut attempt = 0;

    loop {
        match make_request().await {
            Ok(response) if response.status().is_server_error() => {
                attempt += 1;
                if attempt > MAX_RETRIES {
                    return Ok(response);
                }
                tracing::warn!(status = %response.status(), "Server error, retrying request");
            }
            Ok(response) => return Ok(response),
            Err(e) => {
                attempt += 1;
                if attempt > MAX_RETRIES {
                    return Err(e);
                }
                tracing::warn!(error = %e, "Request failed, retrying");
            }
        }
    }
}

/// Request-specific inputs for a manifest request.
#[derive(Clone, Debug, Default)]
pub struct ManifestRequestContext {
    /// Fatal error recorded by the previous run.
    pub fatal_error: Option<String>,
    pub current_update_id: Option<Uuid>,
    pub embedded_update_id: Option<Uuid>,
    /// Headers the server asked to receive on every request.
    pub server_defined_headers: Option<Map<String, Value>>,
}

/// Outcome of a manifest request.
#[derive(Clone, Debug)]
pub struct ManifestResponse {
    /// `None` when the server reports that no update is available.
    pub manifest: Option<UpdateManifest>,
    /// Takes precedence over `manifest` when both are present.
    pub directive: Option<UpdateDirective>,
    pub extensions: ManifestExtensions,
    pub server_defined_headers: Option<Map<String, Value>>,
    pub manifest_filters: Option<ManifestFilters>,
}

/// Named parts of a multipart manifest response, as text.
#[derive(Debug, Default, PartialEq, Eq)]
struct MultipartParts {
    manifest: Option<String>,
    directive: Option<String>,
    extensions: Option<String>,
}

/// An asset file present in the store after a download request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchedAsset {
    pub hash: ContentHash,
    /// False when the file was already on disk and no request was made.
    pub downloaded: bool,
}

/// Downloads manifests and assets for one configuration.
#[derive(Clone)]
pub struct FileDownloader {
    http: reqwest::Client,
    config: Arc<UpdatesConfig>,
    verifier: Option<SignatureVerifier>,
}

impl FileDownloader {
    /// Build a downloader. A configured `public_key_url` enables signature
    /// verification through an HTTP key source.
    pub fn new(config: Arc<UpdatesConfig>) -> LoaderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let verifier = config.public_key_url.as_ref().map(|url| {
            SignatureVerifier::new(Arc::new(HttpKeySource::new(http.clone(), url.clone())))
        });
        Ok(Self {
            http,
            config,
            verifier,
        })
    }

    /// Replace the signature verifier.
    pub fn with_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn config(&self) -> &UpdatesConfig {
        &self.config
    }

    /// Fetch the manifest from the configured update URL.
    #[instrument(skip(self, ctx))]
    pub async fn download_manifest(
        &self,
        ctx: &ManifestRequestContext,
    ) -> LoaderResult<ManifestResponse> {
        let url = self
            .config
            .update_url
            .clone()
            .ok_or_else(|| LoaderError::Config("update_url must be set".to_string()))?;
        let headers = self.manifest_headers(ctx);

        let response = retry_request(|| {
            self.http
                .get(url.clone())
                .headers(headers.clone())
                .send()
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LoaderError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let server_defined_headers =
            json_object_header(response.headers(), SERVER_DEFINED_HEADERS_HEADER);
        let manifest_filters = json_object_header(response.headers(), MANIFEST_FILTERS_HEADER)
            .map(|filters| ManifestFilters::new(filters.into_iter().collect()));

        if status == StatusCode::NO_CONTENT {
            tracing::debug!("Server reported no update available");
            return Ok(ManifestResponse {
                manifest: None,
                directive: None,
                extensions: ManifestExtensions::default(),
                server_defined_headers,
                manifest_filters,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.to_ascii_lowercase().starts_with("multipart/") {
            let boundary = multipart_boundary(&content_type).ok_or_else(|| {
                LoaderError::Multipart("missing boundary in multipart content-type".to_string())
            })?;
            let parts = parse_multipart(response.bytes().await?, boundary).await?;

            let manifest = match &parts.manifest {
                Some(body) => Some(self.parse_manifest_body(body).await?),
                None => None,
            };
            let directive = parts
                .directive
                .as_deref()
                .map(UpdateDirective::from_json)
                .transpose()?;
            let extensions = parts
                .extensions
                .as_deref()
                .map(ManifestExtensions::from_json)
                .transpose()?
                .unwrap_or_default();
            tracing::info!(
                update_id = ?manifest.as_ref().map(|m| m.id),
                ?directive,
                "Downloaded multipart manifest response"
            );

            return Ok(ManifestResponse {
                manifest,
                directive,
                extensions,
                server_defined_headers,
                manifest_filters,
            });
        }

        let body = response.text().await?;
        let manifest = self.parse_manifest_body(&body).await?;
        tracing::info!(update_id = %manifest.id, "Downloaded manifest");

        Ok(ManifestResponse {
            manifest: Some(manifest),
            directive: None,
            extensions: ManifestExtensions::default(),
            server_defined_headers,
            manifest_filters,
        })
    }

    async fn parse_manifest_body(&self, body: &str) -> LoaderResult<UpdateManifest> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| updraft_core::Error::ManifestParse(e.to_string()))?;

        let Some(envelope) = SignedEnvelope::from_value(&value) else {
            if self.config.expects_signed_manifest {
                return Err(LoaderError::Verification(
                    "manifest is not in a signed envelope".to_string(),
                ));
            }
            return Ok(UpdateManifest::from_value(value)?);
        };

        if envelope.is_unsigned() {
            if self.config.expects_signed_manifest {
                return Err(LoaderError::Verification(
                    "manifest is marked unsigned".to_string(),
                ));
            }
            return Ok(UpdateManifest::from_json(&envelope.manifest_string)?);
        }

        let verifier = self.verifier.as_ref().ok_or_else(|| {
            LoaderError::Verification("signed manifest but no public key configured".to_string())
        })?;
        if !verifier
            .verify(&envelope.manifest_string, &envelope.signature)
            .await?
        {
            return Err(LoaderError::Verification(
                "manifest signature is invalid".to_string(),
            ));
        }
        Ok(UpdateManifest::from_json(&envelope.manifest_string)?)
    }

    /// Headers sent with every manifest request.
    pub fn manifest_headers(&self, ctx: &ManifestRequestContext) -> HeaderMap {
        let config = &self.config;
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "accept", MANIFEST_ACCEPT);
        insert_header(&mut headers, "updraft-platform", &config.platform);
        insert_header(
            &mut headers,
            "updraft-protocol-version",
            &PROTOCOL_VERSION.to_string(),
        );
        insert_header(
            &mut headers,
            "updraft-accept-signature",
            if config.expects_signed_manifest {
                "true"
            } else {
                "false"
            },
        );
        insert_header(
            &mut headers,
            "updraft-release-channel",
            &config.release_channel,
        );
        if let Some(runtime_version) = &config.runtime_version {
            insert_header(&mut headers, "updraft-runtime-version", runtime_version);
        } else if let Some(sdk_version) = &config.sdk_version {
            insert_header(&mut headers, "updraft-sdk-version", sdk_version);
        }
        if let Some(fatal_error) = &ctx.fatal_error {
            insert_header(
                &mut headers,
                "updraft-fatal-error",
                &header_safe_truncate(fatal_error, MAX_FATAL_ERROR_LEN),
            );
        }
        if let Some(id) = ctx.current_update_id {
            insert_header(&mut headers, "updraft-current-update-id", &id.to_string());
        }
        if let Some(id) = ctx.embedded_update_id {
            insert_header(&mut headers, "updraft-embedded-update-id", &id.to_string());
        }
        if let Some(server_headers) = &ctx.server_defined_headers {
            for (name, value) in server_headers {
                if let Some(value) = header_value_string(value) {
                    insert_header(&mut headers, name, &value);
                }
            }
        }
        for (name, value) in &config.request_headers {
            insert_header(&mut headers, name, value);
        }
        headers
    }

    /// Download an asset into the store under its content-addressed path.
    ///
    /// A file already present at that path is reused without a request.
    /// `extra_headers` come from the manifest response's extensions.
    #[instrument(skip(self, asset, store, extra_headers), fields(key = %asset.key))]
    pub async fn download_asset(
        &self,
        asset: &ManifestAsset,
        store: &dyn ObjectStore,
        extra_headers: Option<&BTreeMap<String, String>>,
    ) -> LoaderResult<FetchedAsset> {
        let relative_path = asset_relative_path(&asset.key);
        if store.exists(&relative_path).await? {
            let hash = store.hash_object(&relative_path).await?;
            if asset.verify_hash(&hash).is_ok() {
                tracing::debug!(key = %asset.key, "Asset file already present, skipping download");
                return Ok(FetchedAsset {
                    hash,
                    downloaded: false,
                });
            }
            tracing::warn!(key = %asset.key, "Stored asset file does not match its hash");
            store.delete(&relative_path).await?;
        }

        let url = asset.url().cloned().ok_or_else(|| {
            updraft_core::Error::InvalidManifest(format!("asset {} has no url", asset.key))
        })?;
        let mut headers = HeaderMap::new();
        for (name, value) in extra_headers.into_iter().flatten() {
            insert_header(&mut headers, name, value);
        }
        for (name, value) in &self.config.request_headers {
            insert_header(&mut headers, name, value);
        }
        let response = retry_request(|| {
            self.http
                .get(url.clone())
                .headers(headers.clone())
                .send()
        })
        .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoaderError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let mut upload = store.put_stream(&relative_path).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    upload.abort().await?;
                    return Err(e.into());
                }
            };
            if let Err(e) = upload.write(chunk).await {
                upload.abort().await?;
                return Err(e.into());
            }
        }
        let stored = upload.finish().await?;

        if let Err(e) = asset.verify_hash(&stored.hash) {
            store.delete(&relative_path).await?;
            return Err(e.into());
        }

        tracing::debug!(size = stored.size, hash = %stored.hash, "Downloaded asset");
        Ok(FetchedAsset {
            hash: stored.hash,
            downloaded: true,
        })
    }
}

/// The `boundary` parameter of a multipart content type.
fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Split a multipart body into the parts the loader understands.
///
/// An empty body has no parts. Unknown part names are skipped.
async fn parse_multipart(body: Bytes, boundary: String) -> LoaderResult<MultipartParts> {
    let mut parts = MultipartParts::default();
    if body.is_empty() {
        return Ok(parts);
    }

    let stream = futures::stream::once(async move { Ok::<_, std::convert::Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| LoaderError::Multipart(e.to_string()))?
    {
        let name = field.name().map(str::to_owned);
        let text = field
            .text()
            .await
            .map_err(|e| LoaderError::Multipart(e.to_string()))?;
        match name.as_deref() {
            Some("manifest") => parts.manifest = Some(text),
            Some("directive") => parts.directive = Some(text),
            Some("extensions") => parts.extensions = Some(text),
            other => tracing::debug!(part = ?other, "Skipping multipart part"),
        }
    }
    Ok(parts)
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => tracing::warn!(header = name, "Skipping invalid request header"),
    }
}

fn header_value_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some("null".to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Truncate to `max_chars` characters with control characters flattened.
fn header_safe_truncate(s: &str, max_chars: usize) -> String {
    s.chars()
        .take(max_chars)
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

fn json_object_header(headers: &HeaderMap, name: &str) -> Option<Map<String, Value>> {
    let raw = headers.get(name)?.to_str().ok()?;
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        _ => {
            tracing::warn!(header = name, "Ignoring malformed response header");
            None
        }
    }
}
