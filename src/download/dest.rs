//! Local filename derivation for loc.gov delivery URLs.
//!
//! Files are served from a handful of URL families on `tile.loc.gov`. Each
//! family encodes a unique identifier path which is turned into a flat,
//! collision-free filename (path separators become dashes). Unknown URL
//! shapes return `None` and the caller skips the download.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, error};

/// `/storage-services/` static file paths, e.g.
/// `.../storage-services/public/gdcmassbookdig/harriethubbarda00ayer/harriethubbarda00ayer_0002.jp2`.
static STATIC_STORAGE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^.*/storage-services/((?:master|service|public|media)/.+)$").ok()
});

/// `/image-services/iiif/` image requests, e.g.
/// `.../image-services/iiif/public:gdcmassbookdig:...:..._0009/full/pct:12.5/0/default.jpg`.
static IIIF_IMAGE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^.*/image-services/iiif/((?:master|service|public|media):[^/]+)/([^/]*)/([^/]*)/([^/]*)/default\.jpg",
    )
    .ok()
});

/// `/text-services/word-coordinates-service` query URLs, e.g.
/// `.../word-coordinates-service?segment=/public/gdc/.../..._0001.alto.xml&format=alto_xml&full_text=1`.
static TEXT_SERVICE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^.*/text-services/word-coordinates-service\?segment=/((?:master|service|public|media)/.+?)(?:\.alto)?\.xml&(.+)$",
    )
    .ok()
});

/// Options for [`dest_path_with`].
#[derive(Debug, Clone)]
pub struct DestOptions {
    /// Extension for IIIF image output.
    pub iiif_ext: String,
    /// Name IIIF files by identifier only, so that all region/scale variants
    /// of one image share a filename and only the largest is kept.
    pub iiif_largest: bool,
}

impl Default for DestOptions {
    fn default() -> Self {
        Self {
            iiif_ext: ".jpg".to_string(),
            iiif_largest: true,
        }
    }
}

/// Derives the local download path for a loc.gov delivery URL with default
/// options.
#[must_use]
pub fn dest_path(url: &str, base: &Path) -> Option<PathBuf> {
    dest_path_with(url, base, &DestOptions::default())
}

/// Derives the local download path for a loc.gov delivery URL.
///
/// Returns `None` (with a logged error) for blank URLs and URL shapes this
/// library does not recognize.
#[must_use]
pub fn dest_path_with(url: &str, base: &Path, options: &DestOptions) -> Option<PathBuf> {
    if url.is_empty() {
        debug!("skipping blank URL");
        return None;
    }

    if let Some(captures) = STATIC_STORAGE.as_ref().and_then(|re| re.captures(url)) {
        let raw = captures.get(1)?.as_str();
        // Storage paths occasionally percent-encode characters; decode them
        // so the local filename reads like the repository path.
        let decoded = urlencoding::decode(raw).map_or_else(
            |e| {
                debug!(segment = raw, error = %e, "URL decoding failed, using raw path");
                raw.to_string()
            },
            std::borrow::Cow::into_owned,
        );
        return Some(base.join(decoded.replace('/', "-")));
    }

    if let Some(captures) = IIIF_IMAGE.as_ref().and_then(|re| re.captures(url)) {
        let mut ext = options.iiif_ext.clone();
        if !ext.starts_with('.') {
            ext = format!(".{ext}");
        }
        let identifier = captures.get(1)?.as_str().replace(':', "-");
        let relative = if options.iiif_largest {
            format!("{identifier}{ext}")
        } else {
            let region = captures.get(2)?.as_str();
            let size = captures.get(3)?.as_str();
            let rotation = captures.get(4)?.as_str();
            format!("{identifier}-{region}-{size}-{rotation}{ext}")
        };
        return Some(base.join(relative));
    }

    if let Some(captures) = TEXT_SERVICE.as_ref().and_then(|re| re.captures(url)) {
        let mut parts = vec![captures.get(1)?.as_str().replace('/', "-")];
        let query = captures.get(2)?.as_str();
        let params: Vec<(&str, &str)> = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        for key in ["format", "byte_range", "page_number"] {
            if let Some((_, value)) = params.iter().find(|(k, _)| *k == key) {
                parts.push(key.to_string());
                parts.push((*value).to_string());
            }
        }
        if params.iter().any(|(k, _)| *k == "full_text") {
            parts.push("full_text".to_string());
        }
        return Some(base.join(format!("{}.json", parts.join("-"))));
    }

    error!(url, "unrecognized delivery URL pattern; skipping download");
    None
}
