//! Shared User-Agent strings for loc.gov requests.
//!
//! The Library of Congress asks that bulk traffic identify itself so staff can
//! reach operators when a harvest misbehaves. Every request carries the library
//! tag; a caller-supplied identifier (email address or app URL) is prefixed to
//! it when provided.

/// Library tag appended to every User-Agent value.
const LIBRARY_UA_TAG: &str = "locgov-harvest";

/// Default User-Agent when the caller supplies no identifier.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("{LIBRARY_UA_TAG}/{version} (bulk metadata client)")
}

/// User-Agent with a caller identifier (email address or app URL) prefixed.
///
/// Blank identifiers fall back to [`default_user_agent`].
#[must_use]
pub(crate) fn user_agent_with_identity(identity: &str) -> String {
    let identity = identity.trim();
    if identity.is_empty() {
        return default_user_agent();
    }
    format!("{identity} {}", default_user_agent())
}
