//! Reading and writing of update artifacts.
//!
//! Artifacts are tar archives containing, in this order:
//!
//! - `version`: format name and version as JSON.
//! - `manifest`: SHA-256 digests of all other parts.
//! - `manifest.sig` (optional): signature of the manifest.
//! - `header.tar[.gz|.xz]`: artifact metadata, state scripts, and payload headers.
//! - `data/NNNN.tar[.gz|.xz]`: the files of each payload.

use std::io;

use thiserror::Error;

pub mod header;
pub mod manifest;
pub mod reader;
pub mod scripts;
pub mod signature;
pub mod streams;
mod tar_stream;
pub mod writer;

pub use signature::{SignatureError, VerificationKey};

/// Format name of supported artifacts.
pub const ARTIFACT_FORMAT: &str = "mender";
/// Format version of supported artifacts.
pub const ARTIFACT_VERSION: u32 = 3;

/// Error reading an artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("unable to read artifact")]
    Io(#[from] io::Error),
    #[error("invalid artifact: {0}")]
    Format(String),
    #[error("unsupported artifact format {format:?} version {version}")]
    UnsupportedVersion { format: String, version: u32 },
    #[error("unexpected artifact entry `{found}`, expected {expected}")]
    UnexpectedEntry { found: String, expected: String },
    #[error("unexpected end of artifact, expected {0}")]
    UnexpectedEnd(String),
    #[error("`{0}` is not listed in the manifest")]
    NotInManifest(String),
    #[error("checksum mismatch for `{0}`")]
    Checksum(String),
    #[error("invalid JSON in `{name}`")]
    Json {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported compression of `{0}`")]
    UnsupportedCompression(String),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(
        "image not compatible with device {device_type:?}, compatible devices: {}",
        compatible.join(", ")
    )]
    Incompatible {
        device_type: String,
        compatible: Vec<String>,
    },
    #[error("payload type `{0}` is not supported")]
    UnsupportedPayloadType(String),
    #[error("artifacts with more than one payload are not supported yet ({0} payloads)")]
    TooManyPayloads(usize),
    #[error("augmented artifacts are not supported yet")]
    AugmentedUnsupported,
    #[error("payload depends and provides are not supported yet (payload {0})")]
    DependsUnsupported(usize),
    #[error("invalid state script name `{0}`")]
    InvalidScript(String),
    #[error("unable to store state script `{name}`")]
    Script {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("unable to prepare state scripts directory")]
    ScriptsDirectory(#[source] io::Error),
    #[error("artifact headers must be read before the payloads")]
    HeadersNotRead,
}

impl ArtifactError {
    pub(crate) fn json(name: &str, source: serde_json::Error) -> Self {
        Self::Json {
            name: name.to_owned(),
            source,
        }
    }
}
