//! Rate-limit-aware file downloads for loc.gov delivery URLs.
//!
//! - [`dest_path`] turns a delivery URL into a flat local filename
//! - [`download_file`] / [`download_jobs`] stream files to disk through the
//!   shared retry and pacing policy
//! - [`verify_media_type`] validates user-supplied download filters

mod dest;
mod fetch;
mod media_type;

pub use dest::{DestOptions, dest_path, dest_path_with};
pub use fetch::{DownloadJob, DownloadRecord, DownloadReport, FetchError, download_file, download_jobs};
pub use media_type::{KNOWN_MEDIA_TYPES, media_type_suggestions, verify_media_type};
