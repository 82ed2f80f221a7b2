//! Upload format detection.
//!
//! The format is resolved once from the uploaded filename and then matched exhaustively by the
//! conversion pipeline, so a new format cannot silently fall through to the wrong reader.

use std::fmt;
use std::path::Path;

/// CAD file format, derived from the filename suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    /// `.step` or `.stp`
    Step,
    /// `.stl`
    Stl,
    /// `.obj`, recognized but not convertible yet
    Obj,
    /// Anything else. Holds the lower-cased suffix including the dot, or an empty string when the
    /// filename has none.
    Unknown(String),
}

impl Format {
    /// Resolve the format of an uploaded filename.
    pub fn from_filename(filename: &str) -> Self {
        Self::from_extension(&extension_of(filename))
    }

    /// Resolve a lower-cased suffix as produced by [`extension_of`].
    pub fn from_extension(extension: &str) -> Self {
        match extension {
            ".step" | ".stp" => Format::Step,
            ".stl" => Format::Stl,
            ".obj" => Format::Obj,
            other => Format::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Step => f.write_str("STEP"),
            Format::Stl => f.write_str("STL"),
            Format::Obj => f.write_str("OBJ"),
            Format::Unknown(ext) if ext.is_empty() => f.write_str("unknown"),
            Format::Unknown(ext) => write!(f, "unknown ({ext})"),
        }
    }
}

/// Lower-cased trailing suffix of `filename`, including the leading dot.
///
/// Returns an empty string when there is no suffix. Only the final path component is looked at, and
/// a leading dot (`.step`) names a hidden file rather than a suffix.
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}
