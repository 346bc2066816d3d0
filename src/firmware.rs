//! Bootloader artifacts: header validation, fingerprints and sources.
//!
//! Every artifact starts with a fixed 100-byte header:
//!
//! ```text
//!  0        76       80       84              96      100
//!  ├────────┼────────┼────────┼───────────────┼───────┤
//!  │reserved│ magic  │  tag   │   reserved    │version│ body ...
//!  └────────┴────────┴────────┴───────────────┴───────┘
//! ```
//!
//! The header is validated before anything is sent; the image is never
//! interpreted beyond it.

use std::path::PathBuf;

use anyhow::Context;
use log::info;
use serde::Serialize;

use crate::config::DriverConfig;
use crate::error::BootloaderError;

pub const HEADER_LEN: usize = 100;
pub const MAGIC: u32 = 0x4255_4c43;

const MAGIC_OFFSET: usize = 76;
const TAG_OFFSET: usize = 80;
const VERSION_OFFSET: usize = 96;

/// The three artifacts the bootloader asks for, in boot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ArtifactKind {
    /// Firmware-update agent.
    Fwu,
    /// Customer public key.
    Cpk,
    /// Main application binary.
    Mab,
}

impl ArtifactKind {
    pub const ALL: [Self; 3] = [Self::Fwu, Self::Cpk, Self::Mab];

    pub fn tag(self) -> [u8; 4] {
        match self {
            Self::Fwu => *b"FWU\0",
            Self::Cpk => *b"CPK\0",
            Self::Mab => *b"MAB\0",
        }
    }

    /// Argument word of the download command.
    pub fn code(self) -> u32 {
        match self {
            Self::Fwu => 1,
            Self::Cpk => 2,
            Self::Mab => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    /// The artifact a bootloader request state is waiting for.
    pub fn requested_by(state: crate::fsm::DeviceState) -> Option<Self> {
        use crate::fsm::DeviceState;
        match state {
            DeviceState::BootloaderFwu => Some(Self::Fwu),
            DeviceState::BootloaderCpk => Some(Self::Cpk),
            DeviceState::BootloaderMab => Some(Self::Mab),
            _ => None,
        }
    }

    /// The request state for this artifact.
    pub fn request_state(self) -> crate::fsm::DeviceState {
        use crate::fsm::DeviceState;
        match self {
            Self::Fwu => DeviceState::BootloaderFwu,
            Self::Cpk => DeviceState::BootloaderCpk,
            Self::Mab => DeviceState::BootloaderMab,
        }
    }
}

// ── Validation ───────────────────────────────────────────────

/// A validated artifact image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub version: u32,
    pub image: Vec<u8>,
}

impl Artifact {
    /// Check magic and type tag. The image is kept verbatim.
    pub fn parse(kind: ArtifactKind, image: Vec<u8>) -> Result<Self, BootloaderError> {
        if image.len() < HEADER_LEN {
            return Err(BootloaderError::Truncated { len: image.len() });
        }
        let magic = read_u32(&image, MAGIC_OFFSET);
        if magic != MAGIC {
            return Err(BootloaderError::BadMagic(magic));
        }
        let mut found = [0u8; 4];
        found.copy_from_slice(&image[TAG_OFFSET..TAG_OFFSET + 4]);
        if found != kind.tag() {
            return Err(BootloaderError::TypeMismatch {
                expected: kind,
                found,
            });
        }
        Ok(Self {
            kind,
            version: read_u32(&image, VERSION_OFFSET),
            image,
        })
    }

    pub fn body(&self) -> &[u8] {
        &self.image[HEADER_LEN..]
    }

    pub fn fingerprint(&self) -> ArtifactFingerprint {
        ArtifactFingerprint {
            kind: self.kind,
            version: self.version,
            len: self.body().len() as u32,
            sha256: hmac_sha256::Hash::hash(self.body()),
        }
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Build a well-formed image around `body`.
pub fn build_image(kind: ArtifactKind, version: u32, body: &[u8]) -> Vec<u8> {
    let mut image = vec![0u8; HEADER_LEN];
    image[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&MAGIC.to_le_bytes());
    image[TAG_OFFSET..TAG_OFFSET + 4].copy_from_slice(&kind.tag());
    image[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&version.to_le_bytes());
    image.extend_from_slice(body);
    image
}

/// SHA-256 of a transferred artifact body, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArtifactFingerprint {
    pub kind: ArtifactKind,
    pub version: u32,
    pub len: u32,
    pub sha256: [u8; 32],
}

impl ArtifactFingerprint {
    /// Lower-case hex of the digest.
    pub fn hex(&self) -> String {
        use core::fmt::Write;
        self.sha256.iter().fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
    }
}

// ── Sources ──────────────────────────────────────────────────

/// Where artifact images come from.
pub trait FirmwareSource: Send + Sync {
    fn load(&self, kind: ArtifactKind) -> anyhow::Result<Vec<u8>>;
}

/// Reads the configured file names from a directory.
pub struct DirFirmwareSource {
    dir: PathBuf,
    files: [String; 3],
}

impl DirFirmwareSource {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            dir: PathBuf::from(&config.firmware_dir),
            files: ArtifactKind::ALL.map(|k| config.artifact_file(k).to_string()),
        }
    }

    fn path(&self, kind: ArtifactKind) -> PathBuf {
        let idx = ArtifactKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_default();
        self.dir.join(&self.files[idx])
    }
}

impl FirmwareSource for DirFirmwareSource {
    fn load(&self, kind: ArtifactKind) -> anyhow::Result<Vec<u8>> {
        let path = self.path(kind);
        let image = std::fs::read(&path)
            .with_context(|| format!("reading {:?} artifact from {}", kind, path.display()))?;
        info!("BOOT: loaded {} ({} bytes)", path.display(), image.len());
        Ok(image)
    }
}

/// Serves images held in memory.
#[derive(Default)]
pub struct MemoryFirmwareSource {
    images: [Option<Vec<u8>>; 3],
}

impl MemoryFirmwareSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ArtifactKind, image: Vec<u8>) -> Self {
        self.images[kind.code() as usize - 1] = Some(image);
        self
    }

    /// Well-formed images for all three artifacts.
    pub fn complete(version: u32) -> Self {
        ArtifactKind::ALL.into_iter().fold(Self::new(), |src, kind| {
            let body: Vec<u8> = (0..64u8).map(|b| b ^ kind.code() as u8).collect();
            src.with(kind, build_image(kind, version, &body))
        })
    }
}

impl FirmwareSource for MemoryFirmwareSource {
    fn load(&self, kind: ArtifactKind) -> anyhow::Result<Vec<u8>> {
        self.images[kind.code() as usize - 1]
            .clone()
            .with_context(|| format!("no {kind:?} image loaded"))
    }
}
