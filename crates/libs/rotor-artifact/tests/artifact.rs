use std::io::Read;

use serde_json::json;

use rotor_artifact::header::PayloadHeader;
use rotor_artifact::reader::{ArtifactReader, HeaderHooks, NoHooks};
use rotor_artifact::streams::PayloadStreams;
use rotor_artifact::writer::{ArtifactWriter, Compression, PayloadWriter, SigningKey};
use rotor_artifact::{ArtifactError, SignatureError, VerificationKey};

#[derive(Debug, Default)]
struct Recorder {
    events: Vec<String>,
    reject_types: Vec<&'static str>,
}

impl HeaderHooks for Recorder {
    fn compatible_devices(&mut self, devices: &[String]) -> Result<(), ArtifactError> {
        self.events.push(format!("devices {}", devices.join(",")));
        Ok(())
    }

    fn payload_type(&mut self, index: usize, payload_type: &str) -> Result<(), ArtifactError> {
        self.events.push(format!("payload {index} {payload_type}"));
        if self.reject_types.contains(&payload_type) {
            return Err(ArtifactError::UnsupportedPayloadType(payload_type.to_owned()));
        }
        Ok(())
    }

    fn scripts_start(&mut self) -> Result<(), ArtifactError> {
        self.events.push("scripts start".to_owned());
        Ok(())
    }

    fn script(&mut self, name: &str, script: &mut dyn Read) -> Result<(), ArtifactError> {
        let mut content = String::new();
        script.read_to_string(&mut content)?;
        self.events.push(format!("script {name} {content}"));
        Ok(())
    }

    fn scripts_finish(&mut self, version: u32) -> Result<(), ArtifactError> {
        self.events.push(format!("scripts finish {version}"));
        Ok(())
    }
}

fn rootfs_artifact() -> ArtifactWriter {
    ArtifactWriter::new("release-2")
        .artifact_group("stable")
        .device_type("rpi4")
        .device_type("rpi5")
        .script("ArtifactInstall_Enter_10_check", "#!/bin/sh\nexit 0\n")
        .payload(
            PayloadWriter::new("rootfs-image")
                .file("rootfs.ext4", vec![0xAB; 100_000])
                .meta_data(json!({"checksum": "abc"})),
        )
}

fn read_all(streams: &mut dyn PayloadStreams) -> Result<Vec<(String, u64, Vec<u8>)>, ArtifactError> {
    let mut files = Vec::new();
    while let Some(stream) = streams.next_stream()? {
        let mut data = Vec::new();
        stream.reader.read_to_end(&mut data)?;
        files.push((stream.name, stream.size, data));
    }
    Ok(files)
}

fn ed25519_key() -> ed25519_dalek::SigningKey {
    ed25519_dalek::SigningKey::from_bytes(&[42; 32])
}

#[test]
fn test_read_artifact() {
    for compression in [Compression::None, Compression::Gzip, Compression::Xz] {
        let artifact = rootfs_artifact()
            .compression(compression)
            .write(Vec::new())
            .unwrap();
        let mut reader = ArtifactReader::new(&artifact[..]);
        let mut recorder = Recorder::default();
        let headers = reader.read_headers(&mut recorder).unwrap();
        assert_eq!(headers.artifact_name(), "release-2");
        assert_eq!(headers.artifact_group(), Some("stable"));
        assert_eq!(headers.compatible_devices(), ["rpi4", "rpi5"]);
        assert_eq!(headers.scripts, ["ArtifactInstall_Enter_10_check"]);
        assert!(!headers.signed);
        assert_eq!(headers.payloads[0].meta_data, json!({"checksum": "abc"}));
        assert_eq!(
            recorder.events,
            [
                "devices rpi4,rpi5",
                "payload 0 rootfs-image",
                "scripts start",
                "script ArtifactInstall_Enter_10_check #!/bin/sh\nexit 0\n",
                "scripts finish 3",
            ]
        );

        let files = reader
            .read_payload(|payload: &PayloadHeader, streams| {
                assert_eq!(payload.payload_type, "rootfs-image");
                read_all(streams)
            })
            .unwrap()
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "rootfs.ext4");
        assert_eq!(files[0].1, 100_000);
        assert_eq!(files[0].2, vec![0xAB; 100_000]);
        assert!(reader
            .read_payload(|_, _| Ok::<_, ArtifactError>(()))
            .unwrap()
            .is_none());
    }
}

#[test]
fn test_files_are_delivered_in_order() {
    let artifact = ArtifactWriter::new("files")
        .payload(
            PayloadWriter::new("directory")
                .file("a", "first")
                .file("b", "second")
                .file("c", "third"),
        )
        .write(Vec::new())
        .unwrap();
    let mut reader = ArtifactReader::new(&artifact[..]);
    reader.read_headers(&mut NoHooks).unwrap();
    let files = reader.read_payload(|_, streams| read_all(streams)).unwrap().unwrap();
    let names = files.iter().map(|file| file.0.as_str()).collect::<Vec<_>>();
    assert_eq!(names, ["a", "b", "c"]);
}

#[test]
fn test_unread_files_are_verified() {
    let artifact = ArtifactWriter::new("files")
        .compression(Compression::None)
        .payload(
            PayloadWriter::new("directory")
                .file("a", "PAYLOAD-CONTENT")
                .file("b", "second"),
        )
        .write(Vec::new())
        .unwrap();
    let needle = b"PAYLOAD-CONTENT";
    let position = artifact
        .windows(needle.len())
        .position(|window| window == needle)
        .unwrap();
    let mut corrupted = artifact.clone();
    corrupted[position + needle.len() - 1] = b'X';

    let mut reader = ArtifactReader::new(&corrupted[..]);
    reader.read_headers(&mut NoHooks).unwrap();
    let result = reader.read_payload(|_, _| Ok::<_, ArtifactError>(()));
    assert!(matches!(result, Err(ArtifactError::Checksum(name)) if name == "data/0000/a"));

    let mut reader = ArtifactReader::new(&corrupted[..]);
    reader.read_headers(&mut NoHooks).unwrap();
    let error = reader
        .read_payload(|_, streams| read_all(streams))
        .unwrap_err();
    match error {
        ArtifactError::Io(error) => assert_eq!(error.kind(), std::io::ErrorKind::InvalidData),
        error => panic!("expected I/O error, got {error:?}"),
    }
}

#[test]
fn test_signed_artifacts() {
    let key = ed25519_key();
    let verification_key = VerificationKey::Ed25519(key.verifying_key());
    let signed = rootfs_artifact()
        .sign_with(SigningKey::Ed25519(key))
        .write(Vec::new())
        .unwrap();
    let unsigned = rootfs_artifact().write(Vec::new()).unwrap();

    let mut reader =
        ArtifactReader::new(&signed[..]).with_verification_key(Some(verification_key.clone()));
    assert!(reader.read_headers(&mut NoHooks).unwrap().signed);

    let mut reader = ArtifactReader::new(&signed[..]);
    assert!(!reader.read_headers(&mut NoHooks).unwrap().signed);

    let mut reader =
        ArtifactReader::new(&unsigned[..]).with_verification_key(Some(verification_key));
    assert!(matches!(
        reader.read_headers(&mut NoHooks),
        Err(ArtifactError::Signature(SignatureError::Missing))
    ));

    let other = ed25519_dalek::SigningKey::from_bytes(&[1; 32]);
    let mut reader = ArtifactReader::new(&signed[..])
        .with_verification_key(Some(VerificationKey::Ed25519(other.verifying_key())));
    assert!(matches!(
        reader.read_headers(&mut NoHooks),
        Err(ArtifactError::Signature(SignatureError::Invalid))
    ));
}

#[test]
fn test_p256_signed_artifact() {
    let key = p256::ecdsa::SigningKey::from_slice(&[9; 32]).unwrap();
    let verification_key = VerificationKey::EcdsaP256(p256::ecdsa::VerifyingKey::from(&key));
    let signed = rootfs_artifact()
        .sign_with(SigningKey::EcdsaP256(key))
        .write(Vec::new())
        .unwrap();
    let mut reader = ArtifactReader::new(&signed[..]).with_verification_key(Some(verification_key));
    assert!(reader.read_headers(&mut NoHooks).unwrap().signed);
}

#[test]
fn test_rejects_unknown_payload_type() {
    let artifact = ArtifactWriter::new("custom")
        .payload(PayloadWriter::new("custom-module").file("data", "abc"))
        .write(Vec::new())
        .unwrap();
    let mut reader = ArtifactReader::new(&artifact[..]);
    let mut recorder = Recorder {
        reject_types: vec!["custom-module"],
        ..Recorder::default()
    };
    assert!(matches!(
        reader.read_headers(&mut recorder),
        Err(ArtifactError::UnsupportedPayloadType(name)) if name == "custom-module"
    ));
    assert!(!recorder.events.contains(&"scripts start".to_owned()));
    assert!(matches!(
        reader.read_payload(|_, _| Ok::<_, ArtifactError>(())),
        Err(ArtifactError::HeadersNotRead)
    ));
}

#[test]
fn test_rejects_multiple_payloads() {
    let artifact = rootfs_artifact()
        .payload(PayloadWriter::new("rootfs-image").file("other", "x"))
        .write(Vec::new())
        .unwrap();
    let mut recorder = Recorder::default();
    assert!(matches!(
        ArtifactReader::new(&artifact[..]).read_headers(&mut recorder),
        Err(ArtifactError::TooManyPayloads(2))
    ));
    assert!(!recorder.events.iter().any(|event| event.starts_with("payload")));
}

#[test]
fn test_rejects_untyped_payload() {
    let artifact = ArtifactWriter::new("bootstrap")
        .payload(PayloadWriter::untyped())
        .write(Vec::new())
        .unwrap();
    assert!(matches!(
        ArtifactReader::new(&artifact[..]).read_headers(&mut NoHooks),
        Err(ArtifactError::UnsupportedPayloadType(_))
    ));
}

#[test]
fn test_rejects_payload_depends() {
    let artifact = ArtifactWriter::new("delta")
        .payload(
            PayloadWriter::new("rootfs-image")
                .type_info("artifact_depends", json!({"rootfs-image.checksum": "abc"}))
                .file("delta", "x"),
        )
        .write(Vec::new())
        .unwrap();
    assert!(matches!(
        ArtifactReader::new(&artifact[..]).read_headers(&mut NoHooks),
        Err(ArtifactError::DependsUnsupported(0))
    ));
}

#[test]
fn test_rejects_invalid_script_name() {
    let artifact = rootfs_artifact()
        .script("Download_Enter_00", "#!/bin/sh\n")
        .write(Vec::new())
        .unwrap();
    assert!(matches!(
        ArtifactReader::new(&artifact[..]).read_headers(&mut NoHooks),
        Err(ArtifactError::InvalidScript(name)) if name == "Download_Enter_00"
    ));
}

#[test]
fn test_rejects_augmented_artifact() {
    let version = br#"{"format":"mender","version":3}"#;
    let digest = hex::encode(<sha2::Sha256 as sha2::Digest>::digest(version));
    let manifest = format!("{digest}  version\n");
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in [
        ("version", &version[..]),
        ("manifest", manifest.as_bytes()),
        ("manifest-augment", &b""[..]),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, data).unwrap();
    }
    let artifact = builder.into_inner().unwrap();
    assert!(matches!(
        ArtifactReader::new(&artifact[..]).read_headers(&mut NoHooks),
        Err(ArtifactError::AugmentedUnsupported)
    ));
}

#[test]
fn test_rejects_unsupported_version() {
    let mut builder = tar::Builder::new(Vec::new());
    let version = br#"{"format":"mender","version":2}"#;
    let mut header = tar::Header::new_gnu();
    header.set_size(version.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, "version", &version[..])
        .unwrap();
    let artifact = builder.into_inner().unwrap();
    assert!(matches!(
        ArtifactReader::new(&artifact[..]).read_headers(&mut NoHooks),
        Err(ArtifactError::UnsupportedVersion { version: 2, .. })
    ));
}
