use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::types::{TenantRecord, TenantSlug};

const DATABASE_PLACEHOLDER: &str = "{database}";

/// Concrete data store a tenant's business data lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DataStoreTarget {
    database: String,
    #[serde(skip)]
    connection: String,
}

impl DataStoreTarget {
    /// Target built from an explicitly stored connection string.
    pub fn explicit(connection: impl Into<String>) -> Self {
        let connection = connection.into();
        Self {
            database: connection.clone(),
            connection,
        }
    }

    /// Logical database name (the override string itself for explicit targets).
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Connection string handed to the data-access layer.
    pub fn connection(&self) -> &str {
        &self.connection
    }
}

impl fmt::Display for DataStoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.database)
    }
}

/// Deterministic `<prefix>_<tenant-code>_<suffix>` naming plus a connection pattern.
///
/// Empty prefix or suffix segments are omitted, so a `db` prefix with an empty
/// suffix maps `acme` to `db_acme`. Hyphens in the tenant code become
/// underscores; since slugs never contain underscores the mapping stays
/// injective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTemplate {
    prefix: String,
    suffix: String,
    connection_pattern: String,
}

impl TargetTemplate {
    pub fn new(
        prefix: impl Into<String>,
        suffix: impl Into<String>,
        connection_pattern: impl Into<String>,
    ) -> Result<Self, TargetError> {
        let prefix = prefix.into();
        let suffix = suffix.into();
        let connection_pattern = connection_pattern.into();

        for segment in [&prefix, &suffix] {
            if let Some(invalid) = segment
                .chars()
                .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
            {
                return Err(TargetError::InvalidSegment {
                    segment: segment.clone(),
                    invalid,
                });
            }
        }
        if !connection_pattern.contains(DATABASE_PLACEHOLDER) {
            return Err(TargetError::MissingPlaceholder(connection_pattern));
        }

        Ok(Self {
            prefix,
            suffix,
            connection_pattern,
        })
    }

    /// Database name the template assigns to `slug`.
    pub fn database_name(&self, slug: &TenantSlug) -> String {
        let code = slug.as_str().replace('-', "_");
        [self.prefix.as_str(), code.as_str(), self.suffix.as_str()]
            .iter()
            .filter(|segment| !segment.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Resolves the target for `record`. Pure: equal input yields equal output.
    pub fn derive(&self, record: &TenantRecord) -> DataStoreTarget {
        if let Some(explicit) = record
            .connection_override
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return DataStoreTarget::explicit(explicit);
        }

        let database = self.database_name(&record.slug);
        let connection = self
            .connection_pattern
            .replace(DATABASE_PLACEHOLDER, &database);
        DataStoreTarget {
            database,
            connection,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("target template segment {segment:?} contains invalid character {invalid:?}")]
    InvalidSegment { segment: String, invalid: char },
    #[error("connection pattern {0:?} does not contain {{database}}")]
    MissingPlaceholder(String),
}
