//! Domain types of the tenant routing core.
//!
//! Nothing here performs I/O: identifiers and registry records, the pure
//! connection target resolver, and the flow-scoped tenant context.

pub mod context;
pub mod target;
pub mod types;

pub use context::{ContextError, TenantContext};
pub use target::{DataStoreTarget, TargetError, TargetTemplate};
pub use types::{normalize_host, slug_from_host, SlugError, TenantId, TenantRecord, TenantSlug};
