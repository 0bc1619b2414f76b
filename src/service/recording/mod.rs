use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

pub mod segment;

pub use segment::{SegmentError, SegmentWriter};

/// Label made safe for use as a single path component. Separators and control
/// characters become `_`; an empty result falls back to the SSRC.
pub fn sanitize_label(label: &str, ssrc: u32) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        ssrc.to_string()
    } else {
        cleaned
    }
}

pub fn label_dir(base_dir: &Path, label: &str, ssrc: u32) -> PathBuf {
    base_dir.join(sanitize_label(label, ssrc))
}

/// `record-<YYYYmmdd-HHMMSS>-<ssrc>-<label>-<index>.wav`; names of one
/// stream sort chronologically.
pub fn segment_file_name(opened_at: &DateTime<Local>, ssrc: u32, label: &str, index: u32) -> String {
    format!(
        "record-{}-{}-{}-{:04}.wav",
        opened_at.format("%Y%m%d-%H%M%S"),
        ssrc,
        label,
        index
    )
}
