//! Media-type validation for download filters.
//!
//! Users select which files to download by MIME type (`image/jp2`,
//! `audio/mpeg`, ...). Typos would silently match nothing, so candidates are
//! checked against the types that actually appear in loc.gov file listings,
//! and near-misses get a suggestion.

use strsim::jaro_winkler;
use tracing::{debug, error};

/// Media types seen in loc.gov `files` entries.
pub const KNOWN_MEDIA_TYPES: &[&str] = &[
    "application/json",
    "application/pdf",
    "application/xml",
    "application/zip",
    "audio/mpeg",
    "audio/wav",
    "image/gif",
    "image/jp2",
    "image/jpeg",
    "image/png",
    "image/svg+xml",
    "image/tiff",
    "text/plain",
    "text/vtt",
    "text/xml",
    "video/mp4",
    "video/mpeg",
];

/// Similarity floor for whole-string suggestions.
const SUGGESTION_THRESHOLD: f64 = 0.85;

/// Checks a candidate media-type string against [`KNOWN_MEDIA_TYPES`].
///
/// Unknown values are logged together with near matches ("could you have
/// meant ...") so a typo is visible instead of silently filtering out every
/// file.
#[must_use]
pub fn verify_media_type(candidate: &str) -> bool {
    if KNOWN_MEDIA_TYPES.contains(&candidate) {
        debug!(candidate, "media type verified");
        return true;
    }

    let suggestions = media_type_suggestions(candidate);
    if suggestions.is_empty() {
        error!(candidate, "unrecognized media type");
    } else {
        error!(
            candidate,
            suggestions = %suggestions.join(", "),
            "unrecognized media type; could you have meant one of the suggestions?"
        );
    }
    false
}

/// Returns known media types similar to the candidate, best match first.
///
/// Similarity is measured on the whole string and, when the candidate looks
/// like `type/subtype`, on the subtype alone (so `image/jpg` still finds
/// `image/jpeg`).
#[must_use]
pub fn media_type_suggestions(candidate: &str) -> Vec<&'static str> {
    let mut scored: Vec<(&'static str, f64)> = KNOWN_MEDIA_TYPES
        .iter()
        .map(|known| {
            let whole = jaro_winkler(candidate, known);
            let by_subtype = match (candidate.split_once('/'), known.split_once('/')) {
                (Some((ctype, csub)), Some((ktype, ksub))) if ctype == ktype => {
                    jaro_winkler(csub, ksub)
                }
                _ => 0.0,
            };
            (*known, whole.max(by_subtype))
        })
        .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .collect();

    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.into_iter().take(3).map(|(known, _)| known).collect()
}
