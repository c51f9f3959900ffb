//! Building artifacts.

use std::io::{self, Write};

use base64::Engine as _;
use flate2::write::GzEncoder;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use xz2::write::XzEncoder;

use crate::header::{ArtifactDepends, ArtifactProvides, FormatVersion, HeaderInfo, PayloadInfo};
use crate::manifest::Manifest;
use crate::{ARTIFACT_FORMAT, ARTIFACT_VERSION};

/// Compression of the header and payload archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Xz,
}

impl Compression {
    fn archive_name(self, base: &str) -> String {
        match self {
            Compression::None => format!("{base}.tar"),
            Compression::Gzip => format!("{base}.tar.gz"),
            Compression::Xz => format!("{base}.tar.xz"),
        }
    }

    fn compress(self, data: Vec<u8>) -> io::Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&data)?;
                encoder.finish()
            }
            Compression::Xz => {
                let mut encoder = XzEncoder::new(Vec::new(), 6);
                encoder.write_all(&data)?;
                encoder.finish()
            }
        }
    }
}

/// Private key for signing artifacts.
pub enum SigningKey {
    Ed25519(ed25519_dalek::SigningKey),
    EcdsaP256(p256::ecdsa::SigningKey),
}

impl SigningKey {
    fn sign(&self, message: &[u8]) -> String {
        let signature = match self {
            SigningKey::Ed25519(key) => {
                ed25519_dalek::Signer::sign(key, message).to_bytes().to_vec()
            }
            SigningKey::EcdsaP256(key) => {
                let signature: p256::ecdsa::Signature =
                    p256::ecdsa::signature::Signer::sign(key, message);
                signature.to_der().as_bytes().to_vec()
            }
        };
        base64::prelude::BASE64_STANDARD.encode(signature)
    }
}

/// Payload of an artifact being built.
#[derive(Debug, Clone)]
pub struct PayloadWriter {
    payload_type: Option<String>,
    type_info: Map<String, Value>,
    meta_data: Option<Value>,
    files: Vec<(String, Vec<u8>)>,
}

impl PayloadWriter {
    pub fn new(payload_type: impl Into<String>) -> Self {
        Self {
            payload_type: Some(payload_type.into()),
            type_info: Map::new(),
            meta_data: None,
            files: Vec::new(),
        }
    }

    /// Payload with a `null` type.
    pub fn untyped() -> Self {
        Self {
            payload_type: None,
            ..Self::new("")
        }
    }

    /// Add a file to the payload.
    pub fn file(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.files.push((name.into(), data.into()));
        self
    }

    /// Set an additional field of `type-info`.
    pub fn type_info(mut self, key: impl Into<String>, value: Value) -> Self {
        self.type_info.insert(key.into(), value);
        self
    }

    pub fn meta_data(mut self, meta_data: Value) -> Self {
        self.meta_data = Some(meta_data);
        self
    }
}

/// Builder for artifacts.
pub struct ArtifactWriter {
    artifact_name: String,
    artifact_group: Option<String>,
    device_types: Vec<String>,
    scripts: Vec<(String, Vec<u8>)>,
    payloads: Vec<PayloadWriter>,
    compression: Compression,
    signing_key: Option<SigningKey>,
}

impl ArtifactWriter {
    pub fn new(artifact_name: impl Into<String>) -> Self {
        Self {
            artifact_name: artifact_name.into(),
            artifact_group: None,
            device_types: Vec::new(),
            scripts: Vec::new(),
            payloads: Vec::new(),
            compression: Compression::default(),
            signing_key: None,
        }
    }

    pub fn artifact_group(mut self, group: impl Into<String>) -> Self {
        self.artifact_group = Some(group.into());
        self
    }

    /// Add a compatible device type.
    pub fn device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_types.push(device_type.into());
        self
    }

    /// Add a state script.
    pub fn script(mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.scripts.push((name.into(), content.into()));
        self
    }

    pub fn payload(mut self, payload: PayloadWriter) -> Self {
        self.payloads.push(payload);
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sign the manifest of the artifact.
    pub fn sign_with(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Write the artifact to `output`.
    pub fn write<W: Write>(&self, output: W) -> io::Result<W> {
        let mut manifest = Manifest::default();
        let version = serde_json::to_vec(&FormatVersion {
            format: ARTIFACT_FORMAT.to_owned(),
            version: ARTIFACT_VERSION,
        })?;
        manifest.insert("version", Sha256::digest(&version).into());

        let header_name = self.compression.archive_name("header");
        let header = self.compression.compress(self.header_archive()?)?;
        manifest.insert(header_name.clone(), Sha256::digest(&header).into());

        let mut data = Vec::with_capacity(self.payloads.len());
        for (index, payload) in self.payloads.iter().enumerate() {
            let mut archive = tar::Builder::new(Vec::new());
            for (name, content) in &payload.files {
                manifest.insert(
                    format!("data/{index:04}/{name}"),
                    Sha256::digest(content).into(),
                );
                append(&mut archive, name, content)?;
            }
            let archive = self.compression.compress(archive.into_inner()?)?;
            data.push((
                self.compression.archive_name(&format!("data/{index:04}")),
                archive,
            ));
        }

        let manifest = manifest.render();
        let mut builder = tar::Builder::new(output);
        append(&mut builder, "version", &version)?;
        append(&mut builder, "manifest", manifest.as_bytes())?;
        if let Some(key) = &self.signing_key {
            append(&mut builder, "manifest.sig", key.sign(manifest.as_bytes()).as_bytes())?;
        }
        append(&mut builder, &header_name, &header)?;
        for (name, archive) in &data {
            append(&mut builder, name, archive)?;
        }
        builder.into_inner()
    }

    fn header_archive(&self) -> io::Result<Vec<u8>> {
        let info = HeaderInfo {
            payloads: self
                .payloads
                .iter()
                .map(|payload| PayloadInfo {
                    payload_type: payload.payload_type.clone(),
                })
                .collect(),
            artifact_provides: ArtifactProvides {
                artifact_name: self.artifact_name.clone(),
                artifact_group: self.artifact_group.clone(),
            },
            artifact_depends: ArtifactDepends {
                device_type: self.device_types.clone(),
                ..ArtifactDepends::default()
            },
        };
        let mut archive = tar::Builder::new(Vec::new());
        append(&mut archive, "header-info", &serde_json::to_vec(&info)?)?;
        for (name, content) in &self.scripts {
            append(&mut archive, &format!("scripts/{name}"), content)?;
        }
        for (index, payload) in self.payloads.iter().enumerate() {
            let mut type_info = payload.type_info.clone();
            type_info.insert("type".to_owned(), json!(payload.payload_type));
            append(
                &mut archive,
                &format!("headers/{index:04}/type-info"),
                &serde_json::to_vec(&type_info)?,
            )?;
            if let Some(meta_data) = &payload.meta_data {
                append(
                    &mut archive,
                    &format!("headers/{index:04}/meta-data"),
                    &serde_json::to_vec(meta_data)?,
                )?;
            }
        }
        archive.into_inner()
    }
}

fn append<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, name, data)
}
