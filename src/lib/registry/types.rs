use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::advisories::SecurityAdvisory;
use super::version::{UpdateType, VersionComparisonResult, select_latest_tag};
use crate::lib::error::{Classify, ErrorClass};

pub const DOCKER_HUB: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// `[registry[:port]/]repository[:tag][@digest]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> RegistryResult<Self> {
        let reference = reference.trim();
        if reference.is_empty() || reference.contains(char::is_whitespace) {
            return Err(RegistryError::InvalidReference(reference.to_string()));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) if !digest.is_empty() => (name, Some(digest.to_string())),
            Some(_) => return Err(RegistryError::InvalidReference(reference.to_string())),
            None => (reference, None),
        };

        // A tag colon can only appear after the last slash; before it, it's a port.
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (path, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], name[split + 1..].to_string())
            }
            None => (name, DEFAULT_TAG.to_string()),
        };
        if path.is_empty() || tag.is_empty() {
            return Err(RegistryError::InvalidReference(reference.to_string()));
        }

        let (registry, repository) = match path.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB.to_string(), path.to_string()),
        };

        let registry = match registry.as_str() {
            "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
                DOCKER_HUB.to_string()
            }
            _ => registry,
        };

        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(RegistryError::InvalidReference(reference.to_string()));
        }

        Ok(ImageRef {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn with_tag(&self, tag: &str) -> Self {
        ImageRef {
            tag: tag.to_string(),
            digest: None,
            ..self.clone()
        }
    }

    /// `registry/repository`, without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub tag: String,
    pub digest: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
    DockerHub,
    Harbor,
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid image reference: {0}")]
    InvalidReference(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limited by registry")]
    RateLimited,
    #[error("registry request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected registry response: {0}")]
    InvalidResponse(String),
    #[error("registry api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("registry check cancelled")]
    Cancelled,
}

impl Classify for RegistryError {
    fn class(&self) -> ErrorClass {
        match self {
            RegistryError::InvalidReference(_) => ErrorClass::Validation,
            RegistryError::RateLimited | RegistryError::Timeout(_) | RegistryError::Network(_) => {
                ErrorClass::Transient
            }
            RegistryError::Api { status, .. } if *status >= 500 => ErrorClass::Transient,
            RegistryError::NotFound(_)
            | RegistryError::Unauthorized(_)
            | RegistryError::InvalidResponse(_)
            | RegistryError::Api { .. }
            | RegistryError::Cancelled => ErrorClass::Permanent,
        }
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Read-only view of one image registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    fn kind(&self) -> RegistryKind;

    async fn list_tags(&self, image: &ImageRef) -> RegistryResult<Vec<String>>;

    /// Digest and publish time of one tag.
    async fn tag_info(&self, image: &ImageRef, tag: &str) -> RegistryResult<ImageInfo>;

    async fn test_connection(&self) -> RegistryResult<()>;

    async fn search_repositories(&self, query: &str) -> RegistryResult<Vec<String>>;

    /// Newest tag of the image's line (see [`select_latest_tag`]) with its digest.
    async fn get_latest_image_info(&self, image: &ImageRef) -> RegistryResult<ImageInfo> {
        let tags = self.list_tags(image).await?;
        let latest = select_latest_tag(&image.tag, &tags);
        self.tag_info(image, &latest).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    Auto,
    #[default]
    Manual,
    Scheduled,
    Disabled,
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdatePolicy::Auto => "auto",
            UpdatePolicy::Manual => "manual",
            UpdatePolicy::Scheduled => "scheduled",
            UpdatePolicy::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UpdateRecommendation {
    Apply { reason: String },
    AwaitApproval { reason: String },
    Defer { until: Option<DateTime<Utc>> },
    Skip { reason: String },
}

impl UpdateRecommendation {
    pub fn is_apply(&self) -> bool {
        matches!(self, UpdateRecommendation::Apply { .. })
    }
}

impl fmt::Display for UpdateRecommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateRecommendation::Apply { reason } => write!(f, "apply ({})", reason),
            UpdateRecommendation::AwaitApproval { reason } => {
                write!(f, "await approval ({})", reason)
            }
            UpdateRecommendation::Defer { until: Some(until) } => {
                write!(f, "defer until {}", until.to_rfc3339())
            }
            UpdateRecommendation::Defer { until: None } => write!(f, "defer"),
            UpdateRecommendation::Skip { reason } => write!(f, "skip ({})", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCheckResult {
    pub image: ImageRef,
    pub current_tag: String,
    pub latest_tag: String,
    pub current_digest: Option<String>,
    pub latest_digest: Option<String>,
    pub update_available: bool,
    pub update_type: UpdateType,
    pub comparison: VersionComparisonResult,
    pub security_issues: Vec<SecurityAdvisory>,
    pub published_at: Option<DateTime<Utc>>,
    pub checked_at: DateTime<Utc>,
    pub from_cache: bool,
}

impl UpdateCheckResult {
    /// `repository:latest_tag` as the runtime pulls it.
    pub fn latest_reference(&self) -> String {
        self.image.with_tag(&self.latest_tag).to_string()
    }
}
