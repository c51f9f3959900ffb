//! Streaming artifact reader.
//!
//! The reader works in a single forward pass. [`ArtifactReader::read_headers`] reads
//! everything up to and including the header archive, verifying the manifest
//! signature and the header digest before any hook sees header contents. Afterwards,
//! [`ArtifactReader::read_payload`] hands the files of each payload to a consumer;
//! every file is checked against the manifest once it has been read completely.

use std::collections::BTreeMap;
use std::io::{self, Read};

use flate2::read::GzDecoder;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info, warn};
use xz2::read::XzDecoder;

use rotor_common::stream_hasher::StreamHasher;

use crate::header::{ArtifactHeaders, FormatVersion, HeaderInfo, PayloadHeader, TypeInfo};
use crate::manifest::{Manifest, Sha256Digest};
use crate::scripts::is_valid_script_name;
use crate::signature::{SignatureError, VerificationKey};
use crate::streams::{PayloadStream, PayloadStreams};
use crate::tar_stream::TarStream;
use crate::{ArtifactError, ARTIFACT_FORMAT, ARTIFACT_VERSION};

/// Size limit for `version`, `manifest`, and `manifest.sig`.
const MAX_META_SIZE: u64 = 1024 * 1024;

/// Size limit for the compressed header archive.
const MAX_HEADER_SIZE: u64 = 64 * 1024 * 1024;

/// Callbacks invoked while the header archive is processed.
///
/// Returning an error from any hook aborts reading the artifact.
pub trait HeaderHooks {
    /// Called with the device types the artifact is compatible with.
    fn compatible_devices(&mut self, devices: &[String]) -> Result<(), ArtifactError> {
        let _ = devices;
        Ok(())
    }

    /// Called for every payload before any payload data is read.
    fn payload_type(&mut self, index: usize, payload_type: &str) -> Result<(), ArtifactError> {
        let _ = (index, payload_type);
        Ok(())
    }

    /// Called before the first script, even if the artifact has no scripts.
    fn scripts_start(&mut self) -> Result<(), ArtifactError> {
        Ok(())
    }

    /// Called for every state script.
    fn script(&mut self, name: &str, script: &mut dyn Read) -> Result<(), ArtifactError> {
        let _ = (name, script);
        Ok(())
    }

    /// Called after the last script with the artifact format version.
    fn scripts_finish(&mut self, version: u32) -> Result<(), ArtifactError> {
        let _ = version;
        Ok(())
    }
}

/// Hooks accepting everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl HeaderHooks for NoHooks {}

/// Forward-only reader of an artifact.
pub struct ArtifactReader<R> {
    stream: TarStream<R>,
    key: Option<VerificationKey>,
    manifest: Manifest,
    headers: Option<ArtifactHeaders>,
    next_payload: usize,
}

impl<R: Read> ArtifactReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            stream: TarStream::new(reader),
            key: None,
            manifest: Manifest::default(),
            headers: None,
            next_payload: 0,
        }
    }

    /// Require artifacts to be signed with the given key.
    ///
    /// Without a key, signatures are not verified.
    pub fn with_verification_key(mut self, key: Option<VerificationKey>) -> Self {
        self.key = key;
        self
    }

    /// Headers of the artifact, if they have been read.
    pub fn headers(&self) -> Option<&ArtifactHeaders> {
        self.headers.as_ref()
    }

    /// Read and verify the artifact headers.
    pub fn read_headers(
        &mut self,
        hooks: &mut dyn HeaderHooks,
    ) -> Result<&ArtifactHeaders, ArtifactError> {
        if self.headers.is_some() {
            return Err(ArtifactError::Format(
                "headers have already been read".to_owned(),
            ));
        }
        let version_data = self.read_meta("version")?;
        let version: FormatVersion = serde_json::from_slice(&version_data)
            .map_err(|error| ArtifactError::json("version", error))?;
        if version.format != ARTIFACT_FORMAT || version.version != ARTIFACT_VERSION {
            return Err(ArtifactError::UnsupportedVersion {
                format: version.format,
                version: version.version,
            });
        }
        let manifest_data = self.read_meta("manifest")?;
        let manifest = std::str::from_utf8(&manifest_data)
            .map_err(|_| ArtifactError::Format("manifest is not valid UTF-8".to_owned()))?;
        self.manifest = Manifest::parse(manifest)?;
        self.manifest.verify_data("version", &version_data)?;

        let mut signature = None;
        let (header_name, header_data) = loop {
            let mut entry = self
                .stream
                .next_entry()?
                .ok_or_else(|| ArtifactError::UnexpectedEnd("header".to_owned()))?;
            let name = entry.name().to_owned();
            if name == "manifest.sig" && signature.is_none() {
                signature = Some(read_limited(&mut entry, &name, MAX_META_SIZE)?);
                continue;
            }
            if is_augmented(&name) {
                return Err(ArtifactError::AugmentedUnsupported);
            }
            if !name.starts_with("header.tar") {
                return Err(ArtifactError::UnexpectedEntry {
                    found: name,
                    expected: "header archive".to_owned(),
                });
            }
            let data = read_limited(&mut entry, &name, MAX_HEADER_SIZE)?;
            break (name, data);
        };

        let signed = match (&self.key, signature) {
            (Some(key), Some(signature)) => {
                key.verify(&manifest_data, &String::from_utf8_lossy(&signature))?;
                info!(algorithm = key.algorithm(), "verified artifact signature");
                true
            }
            (Some(_), None) => return Err(SignatureError::Missing.into()),
            (None, Some(_)) => {
                warn!("installing signed artifact without verification as verification key is missing");
                false
            }
            (None, None) => {
                info!("no verification key configured, skipping signature verification");
                false
            }
        };
        self.manifest.verify_data(&header_name, &header_data)?;
        debug!(header = %header_name, "verified header digest");

        let headers = parse_header(&header_name, &header_data, version.version, signed, hooks)?;
        info!(
            artifact = headers.artifact_name(),
            payloads = headers.payloads.len(),
            "read artifact headers"
        );
        Ok(self.headers.insert(headers))
    }

    /// Read the next payload, passing its files to `store`.
    ///
    /// Returns `None` once all payloads have been read. Files `store` does not read
    /// completely are still verified against the manifest.
    pub fn read_payload<T, E>(
        &mut self,
        store: impl FnOnce(&PayloadHeader, &mut dyn PayloadStreams) -> Result<T, E>,
    ) -> Result<Option<T>, E>
    where
        E: From<ArtifactError>,
    {
        let headers = self.headers.as_ref().ok_or(ArtifactError::HeadersNotRead)?;
        let index = self.next_payload;
        let Some(mut entry) = self.stream.next_entry().map_err(ArtifactError::from)? else {
            if index < headers.payloads.len() {
                return Err(ArtifactError::UnexpectedEnd(format!("data/{index:04}.tar")).into());
            }
            return Ok(None);
        };
        let name = entry.name().to_owned();
        if is_augmented(&name) {
            return Err(ArtifactError::AugmentedUnsupported.into());
        }
        let Some(payload) = headers.payloads.get(index) else {
            return Err(ArtifactError::UnexpectedEntry {
                found: name,
                expected: "end of artifact".to_owned(),
            }
            .into());
        };
        let expected = format!("data/{index:04}.tar");
        if !name.starts_with(&expected) {
            return Err(ArtifactError::UnexpectedEntry {
                found: name,
                expected: format!("`{expected}`"),
            }
            .into());
        }
        debug!(payload = index, archive = %name, "reading payload");
        let mut archive = tar::Archive::new(decompress(&name, &mut entry)?);
        let entries = archive.entries().map_err(ArtifactError::from)?;
        let mut files = PayloadFiles::new(entries, &self.manifest, index);
        let value = store(payload, &mut files)?;
        files.finish()?;
        self.next_payload += 1;
        Ok(Some(value))
    }

    fn read_meta(&mut self, expected: &str) -> Result<Vec<u8>, ArtifactError> {
        let mut entry = self
            .stream
            .next_entry()?
            .ok_or_else(|| ArtifactError::UnexpectedEnd(format!("`{expected}`")))?;
        if entry.name() != expected {
            return Err(ArtifactError::UnexpectedEntry {
                found: entry.name().to_owned(),
                expected: format!("`{expected}`"),
            });
        }
        read_limited(&mut entry, expected, MAX_META_SIZE)
    }
}

fn is_augmented(name: &str) -> bool {
    name == "manifest-augment" || name.starts_with("header-augment")
}

fn read_limited(reader: &mut impl Read, name: &str, limit: u64) -> Result<Vec<u8>, ArtifactError> {
    let mut data = Vec::new();
    reader.by_ref().take(limit + 1).read_to_end(&mut data)?;
    if data.len() as u64 > limit {
        return Err(ArtifactError::Format(format!(
            "`{name}` exceeds {limit} bytes"
        )));
    }
    Ok(data)
}

/// Wrap `reader` in a decoder for the compression indicated by `name`.
fn decompress<'r>(name: &str, reader: impl Read + 'r) -> Result<Box<dyn Read + 'r>, ArtifactError> {
    if name.ends_with(".tar.gz") {
        Ok(Box::new(GzDecoder::new(reader)))
    } else if name.ends_with(".tar.xz") {
        Ok(Box::new(XzDecoder::new(reader)))
    } else if name.ends_with(".tar") {
        Ok(Box::new(reader))
    } else {
        Err(ArtifactError::UnsupportedCompression(name.to_owned()))
    }
}

fn read_json(name: &str, reader: &mut impl Read) -> Result<Value, ArtifactError> {
    let data = read_limited(reader, name, MAX_HEADER_SIZE)?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&data).map_err(|error| ArtifactError::json(name, error))
}

/// Parse `NNNN/<file>` of a payload header path.
fn payload_header_path(path: &str) -> Option<(usize, &str)> {
    let (index, file) = path.split_once('/')?;
    if index.len() != 4 || !index.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    Some((index.parse().ok()?, file))
}

fn check_payloads(info: &HeaderInfo, hooks: &mut dyn HeaderHooks) -> Result<(), ArtifactError> {
    if info.payloads.len() > 1 {
        return Err(ArtifactError::TooManyPayloads(info.payloads.len()));
    }
    for (index, payload) in info.payloads.iter().enumerate() {
        let Some(payload_type) = payload.payload_type.as_deref() else {
            return Err(ArtifactError::UnsupportedPayloadType("null".to_owned()));
        };
        hooks.payload_type(index, payload_type)?;
    }
    Ok(())
}

fn parse_header(
    name: &str,
    data: &[u8],
    version: u32,
    signed: bool,
    hooks: &mut dyn HeaderHooks,
) -> Result<ArtifactHeaders, ArtifactError> {
    let mut archive = tar::Archive::new(decompress(name, data)?);
    let mut info: Option<(HeaderInfo, Value)> = None;
    let mut scripts = Vec::new();
    let mut type_infos = BTreeMap::new();
    let mut meta_data = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        if path == "header-info" && info.is_none() {
            let json = read_json(&path, &mut entry)?;
            let header_info: HeaderInfo = serde_json::from_value(json.clone())
                .map_err(|error| ArtifactError::json(&path, error))?;
            hooks.compatible_devices(&header_info.artifact_depends.device_type)?;
            check_payloads(&header_info, hooks)?;
            hooks.scripts_start()?;
            info = Some((header_info, json));
            continue;
        }
        let Some((header_info, _)) = &info else {
            return Err(ArtifactError::UnexpectedEntry {
                found: path,
                expected: "`header-info`".to_owned(),
            });
        };
        if let Some(script) = path.strip_prefix("scripts/") {
            if !is_valid_script_name(script) {
                return Err(ArtifactError::InvalidScript(script.to_owned()));
            }
            debug!(script, "found state script");
            hooks.script(script, &mut entry)?;
            scripts.push(script.to_owned());
            continue;
        }
        let Some((index, file)) = path.strip_prefix("headers/").and_then(payload_header_path)
        else {
            return Err(ArtifactError::UnexpectedEntry {
                found: path,
                expected: "state script or payload header".to_owned(),
            });
        };
        if index >= header_info.payloads.len() {
            return Err(ArtifactError::Format(format!(
                "header of undeclared payload {index}"
            )));
        }
        match file {
            "type-info" => {
                let json = read_json(&path, &mut entry)?;
                let type_info: TypeInfo = serde_json::from_value(json.clone())
                    .map_err(|error| ArtifactError::json(&path, error))?;
                if type_info.has_constraints() {
                    return Err(ArtifactError::DependsUnsupported(index));
                }
                type_infos.insert(index, (type_info, json));
            }
            "meta-data" => {
                meta_data.insert(index, read_json(&path, &mut entry)?);
            }
            _ => {
                return Err(ArtifactError::UnexpectedEntry {
                    found: path,
                    expected: "`type-info` or `meta-data`".to_owned(),
                })
            }
        }
    }
    let Some((info, info_json)) = info else {
        return Err(ArtifactError::UnexpectedEnd("`header-info`".to_owned()));
    };
    let mut payloads = Vec::with_capacity(info.payloads.len());
    for (index, payload) in info.payloads.iter().enumerate() {
        let payload_type = payload.payload_type.clone().unwrap_or_default();
        let Some((type_info, type_info_json)) = type_infos.remove(&index) else {
            return Err(ArtifactError::UnexpectedEnd(format!(
                "`headers/{index:04}/type-info`"
            )));
        };
        if type_info.payload_type.as_deref() != Some(payload_type.as_str()) {
            return Err(ArtifactError::Format(format!(
                "type of payload {index} differs between `header-info` and `type-info`"
            )));
        }
        payloads.push(PayloadHeader {
            index,
            payload_type,
            type_info,
            type_info_json,
            meta_data: meta_data.remove(&index).unwrap_or(Value::Null),
        });
    }
    hooks.scripts_finish(version)?;
    Ok(ArtifactHeaders {
        version,
        info,
        info_json,
        scripts,
        payloads,
        signed,
    })
}

/// Payload file whose digest is checked once it has been read completely.
struct VerifiedFile<R> {
    name: String,
    expected: Sha256Digest,
    hasher: StreamHasher<R, Sha256>,
    matches: Option<bool>,
}

impl<R: Read> VerifiedFile<R> {
    fn digest_matches(&mut self) -> bool {
        if self.matches.is_none() {
            self.matches = Some(self.hasher.take_digest()[..] == self.expected);
        }
        self.matches == Some(true)
    }

    /// Read the rest of the file and check its digest.
    fn finish(mut self) -> Result<(), ArtifactError> {
        if self.matches.is_none() {
            io::copy(&mut self.hasher, &mut io::sink())?;
        }
        if !self.digest_matches() {
            return Err(ArtifactError::Checksum(self.name));
        }
        Ok(())
    }
}

impl<R: Read> Read for VerifiedFile<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.matches.is_some() {
            return Ok(0);
        }
        let read = self.hasher.read(buf)?;
        if read == 0 && !buf.is_empty() && !self.digest_matches() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("checksum mismatch for `{}`", self.name),
            ));
        }
        Ok(read)
    }
}

/// Files of a payload archive.
struct PayloadFiles<'a, 'r> {
    entries: tar::Entries<'a, Box<dyn Read + 'r>>,
    prefix: String,
    /// Manifest digests of the files not seen yet.
    pending: BTreeMap<String, Sha256Digest>,
    current: Option<VerifiedFile<tar::Entry<'a, Box<dyn Read + 'r>>>>,
}

impl<'a, 'r> PayloadFiles<'a, 'r> {
    fn new(entries: tar::Entries<'a, Box<dyn Read + 'r>>, manifest: &Manifest, index: usize) -> Self {
        let prefix = format!("data/{index:04}/");
        let pending = manifest
            .names()
            .filter_map(|name| {
                let file = name.strip_prefix(&prefix)?;
                Some((file.to_owned(), *manifest.get(name)?))
            })
            .collect();
        Self {
            entries,
            prefix,
            pending,
            current: None,
        }
    }

    /// Verify all remaining files and check that no file is missing.
    fn finish(mut self) -> Result<(), ArtifactError> {
        while self.next_stream()?.is_some() {}
        if let Some(missing) = self.pending.keys().next() {
            return Err(ArtifactError::UnexpectedEnd(format!(
                "`{}{missing}`",
                self.prefix
            )));
        }
        Ok(())
    }
}

impl PayloadStreams for PayloadFiles<'_, '_> {
    fn next_stream(&mut self) -> Result<Option<PayloadStream<'_>>, ArtifactError> {
        if let Some(file) = self.current.take() {
            file.finish()?;
        }
        for entry in self.entries.by_ref() {
            let entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path()?.to_string_lossy().into_owned();
            let name = path.strip_prefix("./").unwrap_or(&path).to_owned();
            if name.is_empty() || name.contains('/') || name == ".." {
                return Err(ArtifactError::Format(format!(
                    "invalid payload file name {path:?}"
                )));
            }
            let full_name = format!("{}{name}", self.prefix);
            let Some(expected) = self.pending.remove(&name) else {
                return Err(ArtifactError::NotInManifest(full_name));
            };
            let size = entry.size();
            let file = self.current.insert(VerifiedFile {
                name: full_name,
                expected,
                hasher: StreamHasher::new(entry),
                matches: None,
            });
            return Ok(Some(PayloadStream {
                name,
                size,
                reader: file,
            }));
        }
        Ok(None)
    }
}
