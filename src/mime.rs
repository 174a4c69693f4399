//! Multipart form fields for mime-type request bodies.

use std::path::PathBuf;

/// The contents of a mime field: an inline value or a file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimeSource {
    Value(String),
    /// The path is not checked here; the transport opens it at send time,
    /// and a missing file surfaces as a runtime error status.
    File(PathBuf),
}

/// One field of a multipart form submission.
///
/// Mime fields are mutually exclusive with a plain request body, see
/// [`Request::mime_field`](crate::Request::mime_field).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeField {
    name: String,
    source: MimeSource,
}

impl MimeField {
    /// A field with an inline value.
    pub fn value(name: impl Into<String>, value: impl Into<String>) -> MimeField {
        MimeField {
            name: name.into(),
            source: MimeSource::Value(value.into()),
        }
    }

    /// A field whose contents are read from a file at send time.
    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> MimeField {
        MimeField {
            name: name.into(),
            source: MimeSource::File(path.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &MimeSource {
        &self.source
    }
}
