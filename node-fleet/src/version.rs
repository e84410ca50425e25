//! Suggested-version discovery
//!
//! The remote authority publishes, per binary family, the release every
//! node should run. [`HttpVersionSource`] reads it from a JSON document of
//! the shape `processes.<family>.suggested.version`.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ArtifactError, VersionError};

/// Opaque release identifier, compared by equality only
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version(String);

impl Version {
    /// Builds a version, rejecting values that cannot be embedded in a file name
    pub fn new(raw: impl Into<String>) -> Result<Self, ArtifactError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if trimmed.is_empty()
            || trimmed.contains(['/', '\\'])
            || trimmed.starts_with('.')
        {
            return Err(ArtifactError::InvalidVersion(raw));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Version {
    type Error = ArtifactError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Version::new(value)
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.0
    }
}

/// Source of the currently suggested version. Stateless, no retries.
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn suggested_version(&self) -> Result<Version, VersionError>;
}

/// Queries the version authority over HTTPS
pub struct HttpVersionSource {
    client: reqwest::Client,
    endpoint: String,
    family: String,
}

impl HttpVersionSource {
    pub fn new(endpoint: impl Into<String>, family: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("node-fleet/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            client,
            endpoint: endpoint.into(),
            family: family.into(),
        }
    }
}

#[async_trait]
impl VersionSource for HttpVersionSource {
    async fn suggested_version(&self) -> Result<Version, VersionError> {
        debug!("Querying suggested version from {}", self.endpoint);

        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| VersionError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VersionError::Unavailable(format!(
                "authority answered {}",
                response.status()
            )));
        }

        let document: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VersionError::Unavailable(format!("malformed response: {e}")))?;

        suggested_from_document(&document, &self.family)
    }
}

/// Extracts `processes.<family>.suggested.version` from the authority's document
pub fn suggested_from_document(
    document: &serde_json::Value,
    family: &str,
) -> Result<Version, VersionError> {
    let raw = document
        .pointer(&format!("/processes/{family}/suggested/version"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            VersionError::Unavailable(format!("no suggested version for {family} in response"))
        })?;

    Version::new(raw).map_err(|e| VersionError::Unavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_rejects_path_like_values() {
        assert!(Version::new("").is_err());
        assert!(Version::new("  ").is_err());
        assert!(Version::new("../1.2.3").is_err());
        assert!(Version::new("1.2\\3").is_err());
        assert_eq!(Version::new(" v1.76.2 ").unwrap().as_str(), "1.76.2");
    }

    #[test]
    fn test_only_one_leading_v_is_stripped() {
        assert_eq!(Version::new("vv1.2").unwrap().as_str(), "v1.2");
        assert!(Version::new("v").is_err());
    }

    #[test]
    fn test_suggested_version_extraction() {
        let document = json!({
            "processes": {
                "storagenode": { "suggested": { "version": "1.76.2", "url": "..." } },
                "satellite": { "suggested": { "version": "1.80.0" } }
            }
        });

        let version = suggested_from_document(&document, "storagenode").unwrap();
        assert_eq!(version, Version::new("1.76.2").unwrap());
    }

    #[test]
    fn test_malformed_document_is_unavailable() {
        let document = json!({ "processes": { "storagenode": { "suggested": {} } } });
        let err = suggested_from_document(&document, "storagenode").unwrap_err();
        assert!(matches!(err, VersionError::Unavailable(_)));

        let document = json!({ "processes": { "storagenode": { "suggested": { "version": 7 } } } });
        assert!(suggested_from_document(&document, "storagenode").is_err());
    }

    #[test]
    fn test_version_serde_roundtrip_validates() {
        let version: Version = serde_yaml::from_str("\"1.2.3\"").unwrap();
        assert_eq!(version.as_str(), "1.2.3");
        assert!(serde_yaml::from_str::<Version>("\"a/b\"").is_err());
    }
}
