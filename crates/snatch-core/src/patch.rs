//! RFC 6902 patch operations.
//!
//! Only what the mutation policy needs is representable: a single `add` at a
//! typed path. Paths are built from segments and escaped on serialization, so
//! a malformed JSON pointer cannot be constructed.

use std::fmt;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// A JSON pointer (RFC 6901) built from unescaped segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPath {
    segments: Vec<String>,
}

impl PatchPath {
    /// Build a path from its segments, outermost first.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// The unescaped segments of this path.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Render as an escaped JSON pointer (`/spec/affinity`).
    #[must_use]
    pub fn to_pointer(&self) -> String {
        self.segments.iter().fold(String::new(), |mut out, seg| {
            out.push('/');
            out.push_str(&seg.replace('~', "~0").replace('/', "~1"));
            out
        })
    }
}

impl fmt::Display for PatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_pointer())
    }
}

/// One JSON-patch operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOperation {
    /// Create (or replace) the member at `path` with `value`.
    Add {
        /// Target location.
        path: PatchPath,
        /// Value to place there.
        value: Value,
    },
}

impl PatchOperation {
    /// Target location of this operation.
    #[must_use]
    pub fn path(&self) -> &PatchPath {
        match self {
            Self::Add { path, .. } => path,
        }
    }

    /// Serialize a list of operations into the JSON-patch document body.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be serialized.
    pub fn to_document(ops: &[Self]) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(ops)
    }
}

impl Serialize for PatchOperation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Add { path, value } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("op", "add")?;
                map.serialize_entry("path", &path.to_pointer())?;
                map.serialize_entry("value", value)?;
                map.end()
            }
        }
    }
}
