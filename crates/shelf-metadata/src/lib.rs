//! Metadata provider client and confidence gating.
//!
//! Resolves a free-text `(platform, title)` pair to a canonical provider
//! record. The client is deliberately cautious: the top search result is
//! accepted only when its canonical title (or an alternative name) matches
//! the query exactly after normalization, otherwise the lookup reports no
//! match rather than guessing.

pub mod metadata_client;
pub mod metadata_match;

pub use metadata_client::{MetadataClient, MetadataClientConfig};
pub use metadata_match::{choose_confident_match, MetadataCandidate, MetadataMatch};
