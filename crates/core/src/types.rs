use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const MAX_SLUG_LEN: usize = 63;

/// Stable identifier of a tenant. Assigned once at registration and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TenantId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim()).map(Self)
    }
}

/// Routing key of a tenant: lowercase ASCII letters, digits and inner hyphens.
///
/// Parsing lowercases its input, so matching on slugs is case-insensitive. A
/// parsed slug is always safe to interpolate into a data-store target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TenantSlug(String);

impl TenantSlug {
    pub fn parse(raw: &str) -> Result<Self, SlugError> {
        let value = raw.trim().to_ascii_lowercase();
        if value.is_empty() {
            return Err(SlugError::Empty);
        }
        if value.len() > MAX_SLUG_LEN {
            return Err(SlugError::TooLong(value.len()));
        }
        if let Some(invalid) = value
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(SlugError::InvalidCharacter(invalid));
        }
        if value.starts_with('-') || value.ends_with('-') {
            return Err(SlugError::EdgeHyphen);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantSlug {
    type Err = SlugError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl<'de> Deserialize<'de> for TenantSlug {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Reasons a tenant slug is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlugError {
    #[error("tenant slug must not be empty")]
    Empty,
    #[error("tenant slug is {0} characters long, the limit is 63")]
    TooLong(usize),
    #[error("tenant slug contains invalid character {0:?}")]
    InvalidCharacter(char),
    #[error("tenant slug must not start or end with a hyphen")]
    EdgeHyphen,
}

/// Snapshot of a row in the tenant registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantRecord {
    pub id: TenantId,
    pub slug: TenantSlug,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
    pub is_active: bool,
    /// Explicit connection string that replaces the template-derived target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_override: Option<String>,
    /// Incremented by every registry mutation.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Lowercases a `Host` header value and strips its port and trailing dot.
pub fn normalize_host(raw: &str) -> String {
    let host = raw.trim();
    let host = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Derives the tenant slug carried in the leftmost label of `host`.
///
/// With a base domain configured, only a single label directly under it
/// counts (`acme.example.com` under `example.com`). Without one, the first
/// label of any dotted host is used.
pub fn slug_from_host(host: &str, base_domain: Option<&str>) -> Option<TenantSlug> {
    let host = normalize_host(host);
    let label = match base_domain {
        Some(base) => {
            let base = normalize_host(base);
            let prefix = host.strip_suffix(&base)?.strip_suffix('.')?;
            if prefix.contains('.') {
                return None;
            }
            prefix.to_string()
        }
        None => {
            let (label, rest) = host.split_once('.')?;
            if rest.is_empty() {
                return None;
            }
            label.to_string()
        }
    };
    TenantSlug::parse(&label).ok()
}
