//! Update manifests, signed envelopes, and manifest filters.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use time::{OffsetDateTime, UtcOffset};
use time::format_description::well_known::Rfc3339;
use url::Url;
use uuid::Uuid;

/// Signature value servers send for manifests they do not sign.
pub const UNSIGNED_SIGNATURE: &str = "UNSIGNED";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Where an asset's bytes come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssetSource {
    /// Downloaded over HTTP.
    Remote(Url),
    /// Copied from the embedded package, by file name.
    Embedded(String),
}

/// An asset entry in a manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestAsset {
    pub key: String,
    pub source: AssetSource,
    pub content_type: String,
    pub is_launch_asset: bool,
    /// Base64url SHA-256 the server promises for the bytes.
    pub expected_hash: Option<String>,
}

impl ManifestAsset {
    pub fn url(&self) -> Option<&Url> {
        match &self.source {
            AssetSource::Remote(url) => Some(url),
            AssetSource::Embedded(_) => None,
        }
    }

    pub fn embedded_locator(&self) -> Option<&str> {
        match &self.source {
            AssetSource::Remote(_) => None,
            AssetSource::Embedded(name) => Some(name),
        }
    }

    /// Check downloaded bytes against the promised hash, if any.
    pub fn verify_hash(&self, actual: &ContentHash) -> Result<()> {
        let Some(expected) = &self.expected_hash else {
            return Ok(());
        };
        let expected_hash = ContentHash::from_base64url(expected)?;
        if &expected_hash != actual {
            return Err(Error::HashMismatch {
                expected: expected.clone(),
                actual: actual.to_base64url(),
            });
        }
        Ok(())
    }
}

/// A parsed and validated update manifest.
#[derive(Clone, Debug)]
pub struct UpdateManifest {
    pub id: Uuid,
    pub commit_time: OffsetDateTime,
    pub runtime_version: String,
    /// Free-form metadata, matched against manifest filters.
    pub metadata: Map<String, Value>,
    pub assets: Vec<ManifestAsset>,
    /// The manifest exactly as received, persisted with the update.
    pub raw: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    id: Uuid,
    commit_time: Value,
    runtime_version: Option<String>,
    sdk_version: Option<String>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
    #[serde(default)]
    assets: Vec<RawAsset>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAsset {
    key: String,
    url: Option<Url>,
    embedded_locator: Option<String>,
    content_type: Option<String>,
    #[serde(default)]
    is_launch_asset: bool,
    hash: Option<String>,
}

impl UpdateManifest {
    /// Parse a manifest from its JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::ManifestParse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Parse and validate a manifest from a JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawManifest = serde_json::from_value(value.clone())
            .map_err(|e| Error::ManifestParse(e.to_string()))?;

        let commit_time = parse_commit_time(&raw.commit_time)?;
        let runtime_version = raw
            .runtime_version
            .or(raw.sdk_version)
            .ok_or_else(|| Error::InvalidManifest("missing runtimeVersion".to_string()))?;

        let mut assets = Vec::with_capacity(raw.assets.len());
        for asset in raw.assets {
            if asset.key.is_empty() {
                return Err(Error::InvalidManifest("asset with empty key".to_string()));
            }
            let source = match (asset.url, asset.embedded_locator) {
                (Some(url), None) => AssetSource::Remote(url),
                (None, Some(name)) => AssetSource::Embedded(name),
                _ => {
                    return Err(Error::InvalidManifest(format!(
                        "asset {} must have exactly one of url or embeddedLocator",
                        asset.key
                    )));
                }
            };
            assets.push(ManifestAsset {
                key: asset.key,
                source,
                content_type: asset
                    .content_type
                    .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
                is_launch_asset: asset.is_launch_asset,
                expected_hash: asset.hash,
            });
        }

        let launch_keys: HashSet<&str> = assets
            .iter()
            .filter(|a| a.is_launch_asset)
            .map(|a| a.key.as_str())
            .collect();
        if launch_keys.len() != 1 {
            return Err(Error::InvalidManifest(format!(
                "expected exactly one launch asset, found {}",
                launch_keys.len()
            )));
        }

        Ok(Self {
            id: raw.id,
            commit_time,
            runtime_version,
            metadata: raw.metadata.unwrap_or_default(),
            assets,
            raw: value,
        })
    }

    /// The entry-point asset.
    pub fn launch_asset(&self) -> &ManifestAsset {
        // Validated on construction.
        self.assets
            .iter()
            .find(|a| a.is_launch_asset)
            .unwrap_or(&self.assets[0])
    }

    /// Assets with duplicate keys removed, first occurrence wins.
    ///
    /// A key that appears as the launch asset anywhere keeps that flag.
    pub fn unique_assets(&self) -> Vec<ManifestAsset> {
        let launch_key = self.launch_asset().key.clone();
        let mut seen = HashSet::new();
        self.assets
            .iter()
            .filter(|a| seen.insert(a.key.as_str()))
            .map(|a| ManifestAsset {
                is_launch_asset: a.key == launch_key,
                ..a.clone()
            })
            .collect()
    }
}

fn parse_commit_time(value: &Value) -> Result<OffsetDateTime> {
    match value {
        Value::String(s) => OffsetDateTime::parse(s, &Rfc3339)
            .map(|t| t.to_offset(UtcOffset::UTC))
            .map_err(|e| Error::InvalidManifest(format!("invalid commitTime: {e}"))),
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .ok_or_else(|| Error::InvalidManifest(format!("invalid commitTime: {n}")))?;
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
                .map_err(|e| Error::InvalidManifest(format!("invalid commitTime: {e}")))
        }
        other => Err(Error::InvalidManifest(format!(
            "invalid commitTime: {other}"
        ))),
    }
}

/// Instruction a server sends instead of, or alongside, a manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateDirective {
    NoUpdateAvailable,
    /// Launch the embedded update again, treating it as committed at
    /// `commit_time`.
    RollBackToEmbedded { commit_time: OffsetDateTime },
}

impl UpdateDirective {
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::ManifestParse(e.to_string()))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidManifest("directive has no type".to_string()))?;
        match kind {
            "noUpdateAvailable" => Ok(Self::NoUpdateAvailable),
            "rollBackToEmbedded" => {
                let commit_time = value
                    .get("parameters")
                    .and_then(|p| p.get("commitTime"))
                    .ok_or_else(|| {
                        Error::InvalidManifest("rollback directive has no commitTime".to_string())
                    })?;
                Ok(Self::RollBackToEmbedded {
                    commit_time: parse_commit_time(commit_time)?,
                })
            }
            other => Err(Error::InvalidManifest(format!(
                "unknown directive type: {other}"
            ))),
        }
    }
}

/// Extra data sent in the `extensions` part of a multipart response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestExtensions {
    /// Request headers to send when downloading an asset, by asset key.
    #[serde(default)]
    pub asset_request_headers: BTreeMap<String, BTreeMap<String, String>>,
}

impl ManifestExtensions {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    pub fn headers_for(&self, key: &str) -> Option<&BTreeMap<String, String>> {
        self.asset_request_headers.get(key)
    }
}

/// A manifest wrapped with its signature.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedEnvelope {
    pub manifest_string: String,
    pub signature: String,
}

impl SignedEnvelope {
    /// Interpret a response body as an envelope, if it has that shape.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.get("manifestString")?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn is_unsigned(&self) -> bool {
        self.signature == UNSIGNED_SIGNATURE
    }
}

/// Server-provided filters restricting which updates may launch.
///
/// A filter only applies to manifests whose metadata carries the same key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestFilters(BTreeMap<String, Value>);

impl ManifestFilters {
    pub fn new(filters: BTreeMap<String, Value>) -> Self {
        Self(filters)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether manifest metadata satisfies every applicable filter.
    pub fn passes(&self, metadata: &Map<String, Value>) -> bool {
        self.0.iter().all(|(key, expected)| match metadata.get(key) {
            Some(actual) => actual == expected,
            None => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest_json() -> Value {
        json!({
            "id": "0754dad0-d200-d634-113c-ef1f26106028",
            "commitTime": "2024-03-01T12:00:00Z",
            "runtimeVersion": "1.0.0",
            "metadata": {"branch": "main"},
            "assets": [
                {"key": "bundle.js", "url": "https://cdn.example.com/bundle.js",
                 "contentType": "application/javascript", "isLaunchAsset": true},
                {"key": "x.png", "url": "https://cdn.example.com/x.png", "contentType": "image/png"}
            ]
        })
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = UpdateManifest::from_value(manifest_json()).unwrap();
        assert_eq!(manifest.runtime_version, "1.0.0");
        assert_eq!(manifest.assets.len(), 2);
        assert_eq!(manifest.launch_asset().key, "bundle.js");
        assert_eq!(manifest.metadata.get("branch"), Some(&json!("main")));
    }

    #[test]
    fn test_commit_time_epoch_millis() {
        let mut value = manifest_json();
        value["commitTime"] = json!(1_700_000_000_000_i64);
        let manifest = UpdateManifest::from_value(value).unwrap();
        assert_eq!(manifest.commit_time.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_sdk_version_fallback() {
        let mut value = manifest_json();
        value.as_object_mut().unwrap().remove("runtimeVersion");
        value["sdkVersion"] = json!("49.0.0");
        let manifest = UpdateManifest::from_value(value).unwrap();
        assert_eq!(manifest.runtime_version, "49.0.0");
    }

    #[test]
    fn test_rejects_missing_launch_asset() {
        let mut value = manifest_json();
        value["assets"][0]["isLaunchAsset"] = json!(false);
        assert!(matches!(
            UpdateManifest::from_value(value),
            Err(Error::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_rejects_asset_with_both_sources() {
        let mut value = manifest_json();
        value["assets"][1]["embeddedLocator"] = json!("x.png");
        assert!(UpdateManifest::from_value(value).is_err());
    }

    #[test]
    fn test_unique_assets_drops_duplicate_keys() {
        let mut value = manifest_json();
        value["assets"]
            .as_array_mut()
            .unwrap()
            .push(json!({"key": "x.png", "url": "https://mirror.example.com/x.png"}));
        let manifest = UpdateManifest::from_value(value).unwrap();
        let unique = manifest.unique_assets();
        assert_eq!(unique.len(), 2);
        assert_eq!(
            unique[1].url().unwrap().as_str(),
            "https://cdn.example.com/x.png"
        );
    }

    #[test]
    fn test_envelope_detection() {
        let envelope = json!({"manifestString": "{}", "signature": "UNSIGNED"});
        let parsed = SignedEnvelope::from_value(&envelope).unwrap();
        assert!(parsed.is_unsigned());
        assert!(SignedEnvelope::from_value(&manifest_json()).is_none());
    }

    #[test]
    fn test_expected_hash_mismatch() {
        let asset = ManifestAsset {
            key: "a".to_string(),
            source: AssetSource::Embedded("a".to_string()),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            is_launch_asset: true,
            expected_hash: Some(ContentHash::compute(b"good").to_base64url()),
        };
        assert!(asset.verify_hash(&ContentHash::compute(b"good")).is_ok());
        assert!(matches!(
            asset.verify_hash(&ContentHash::compute(b"bad")),
            Err(Error::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_filters_only_apply_to_present_keys() {
        let filters = ManifestFilters::new(BTreeMap::from([(
            "branch".to_string(),
            json!("main"),
        )]));
        let mut metadata = Map::new();
        assert!(filters.passes(&metadata));
        metadata.insert("branch".to_string(), json!("main"));
        assert!(filters.passes(&metadata));
        metadata.insert("branch".to_string(), json!("staging"));
        assert!(!filters.passes(&metadata));
    }

    #[test]
    fn test_parse_directives() {
        assert_eq!(
            UpdateDirective::from_json(r#"{"type": "noUpdateAvailable"}"#).unwrap(),
            UpdateDirective::NoUpdateAvailable
        );

        let rollback = UpdateDirective::from_value(&json!({
            "type": "rollBackToEmbedded",
            "parameters": {"commitTime": "2024-05-01T00:00:00Z"}
        }))
        .unwrap();
        let UpdateDirective::RollBackToEmbedded { commit_time } = rollback else {
            panic!("expected a rollback directive");
        };
        assert_eq!(commit_time.unix_timestamp(), 1_714_521_600);

        assert!(UpdateDirective::from_value(&json!({"type": "rollBackToEmbedded"})).is_err());
        assert!(UpdateDirective::from_value(&json!({"type": "restart"})).is_err());
    }

    #[test]
    fn test_extensions_asset_headers() {
        let extensions = ManifestExtensions::from_json(
            r#"{"assetRequestHeaders": {"bundle.js": {"authorization": "Bearer t"}}}"#,
        )
        .unwrap();
        assert_eq!(
            extensions
                .headers_for("bundle.js")
                .and_then(|h| h.get("authorization"))
                .map(String::as_str),
            Some("Bearer t")
        );
        assert!(extensions.headers_for("x.png").is_none());
        assert_eq!(
            ManifestExtensions::from_json("{}").unwrap(),
            ManifestExtensions::default()
        );
    }
}
