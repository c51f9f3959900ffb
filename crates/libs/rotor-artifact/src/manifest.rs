//! Artifact manifest listing the SHA-256 digest of every artifact part.

use std::collections::BTreeMap;
use std::fmt::Write;

use sha2::{Digest, Sha256};

use crate::ArtifactError;

/// SHA-256 digest.
pub type Sha256Digest = [u8; 32];

/// Parsed manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    digests: BTreeMap<String, Sha256Digest>,
}

impl Manifest {
    /// Parse a manifest consisting of `<hex digest>  <name>` lines.
    pub fn parse(manifest: &str) -> Result<Self, ArtifactError> {
        let mut digests = BTreeMap::new();
        for line in manifest.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Some((digest, name)) = line.split_once(char::is_whitespace) else {
                return Err(invalid_line(line));
            };
            let name = name.trim_start();
            let mut bytes = [0; 32];
            hex::decode_to_slice(digest, &mut bytes).map_err(|_| invalid_line(line))?;
            if name.is_empty() || digests.insert(name.to_owned(), bytes).is_some() {
                return Err(invalid_line(line));
            }
        }
        Ok(Self { digests })
    }

    /// Digest recorded for the given part.
    pub fn get(&self, name: &str) -> Option<&Sha256Digest> {
        self.digests.get(name)
    }

    /// Check that `digest` is the recorded digest of the part.
    pub fn verify(&self, name: &str, digest: &[u8]) -> Result<(), ArtifactError> {
        match self.get(name) {
            Some(expected) if expected[..] == *digest => Ok(()),
            Some(_) => Err(ArtifactError::Checksum(name.to_owned())),
            None => Err(ArtifactError::NotInManifest(name.to_owned())),
        }
    }

    /// Check the digest of a part which has been read completely.
    pub fn verify_data(&self, name: &str, data: &[u8]) -> Result<(), ArtifactError> {
        self.verify(name, &Sha256::digest(data))
    }

    /// Names of all parts listed in the manifest.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.digests.keys().map(String::as_str)
    }

    /// Record the digest of a part.
    pub fn insert(&mut self, name: impl Into<String>, digest: Sha256Digest) {
        self.digests.insert(name.into(), digest);
    }

    /// Render the manifest in its textual form.
    pub fn render(&self) -> String {
        let mut output = String::new();
        for (name, digest) in &self.digests {
            let _ = writeln!(output, "{}  {name}", hex::encode(digest));
        }
        output
    }
}

fn invalid_line(line: &str) -> ArtifactError {
    ArtifactError::Format(format!("invalid manifest line {line:?}"))
}
