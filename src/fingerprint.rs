//! Content fingerprinting for candidate files
//!
//! Produces a compact identifier from a bounded prefix of a file: FLAC files
//! yield the 16-byte audio MD5 stored in their STREAMINFO block, everything
//! else yields a SHA-256 over the prefix itself.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Prefix length requested for FLAC files. Generous enough to cover the
/// stream marker, STREAMINFO, and any padding/vorbis-comment blocks that
/// precede it in the wild.
pub const FLAC_PREFIX_BYTES: u64 = 64 * 1024;

/// Prefix length requested for non-FLAC files.
pub const DEFAULT_NON_FLAC_PREFIX_BYTES: u64 = 32 * 1024;

const FLAC_MARKER: &[u8; 4] = b"fLaC";
const STREAMINFO_LEN: usize = 34;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("malformed header: {0}")]
    MalformedHeader(String),
}

/// How the fingerprint bytes were derived. Fingerprints of different kinds
/// are never equal, even when the bytes happen to collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FingerprintKind {
    /// 16-byte audio MD5 extracted from a FLAC STREAMINFO block.
    FlacStreamInfoMd5,
    /// 32-byte SHA-256 over the file's leading bytes.
    Sha256Prefix,
}

/// A content fingerprint: kind plus raw digest bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub kind: FingerprintKind,
    pub bytes: Vec<u8>,
}

impl Fingerprint {
    pub fn new(kind: FingerprintKind, bytes: Vec<u8>) -> Self {
        Self { kind, bytes }
    }

    /// Reconstruct a fingerprint from raw stored bytes. The kind is encoded
    /// in the digest length: 16 bytes is a FLAC audio MD5, 32 a SHA-256
    /// prefix digest. Anything else is not a fingerprint we ever wrote.
    pub fn from_raw(bytes: &[u8]) -> Option<Self> {
        let kind = match bytes.len() {
            16 => FingerprintKind::FlacStreamInfoMd5,
            32 => FingerprintKind::Sha256Prefix,
            _ => return None,
        };
        Some(Self {
            kind,
            bytes: bytes.to_vec(),
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self.kind, self.to_hex())
    }
}

/// Codec hints extracted from a FLAC STREAMINFO block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecMeta {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub total_samples: u64,
}

impl CodecMeta {
    /// Pack the hints into a u32 for storage and gossip. Bit 31 marks the
    /// flags as present; sample rate occupies the low 20 bits, channels-1
    /// bits 20..23, bits-per-sample-1 bits 23..28. Total samples do not fit
    /// and travel in the inventory columns instead.
    pub fn to_flags(&self) -> u32 {
        let rate = self.sample_rate.min((1 << 20) - 1);
        let ch = u32::from(self.channels.saturating_sub(1)) & 0x7;
        let bps = u32::from(self.bits_per_sample.saturating_sub(1)) & 0x1f;
        (1 << 31) | (bps << 23) | (ch << 20) | rate
    }

    pub fn from_flags(flags: u32) -> Option<Self> {
        if flags & (1 << 31) == 0 {
            return None;
        }
        Some(Self {
            sample_rate: flags & ((1 << 20) - 1),
            channels: ((flags >> 20) & 0x7) as u8 + 1,
            bits_per_sample: ((flags >> 23) & 0x1f) as u8 + 1,
            total_samples: 0,
        })
    }
}

/// Whether a file name refers to a FLAC file, by extension.
pub fn is_flac(path: &str) -> bool {
    path.rsplit('.')
        .next()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("flac"))
}

/// Number of leading bytes a probe must fetch to fingerprint the named file.
pub fn minimum_prefix_bytes(path: &str, non_flac_prefix: u64) -> u64 {
    if is_flac(path) {
        FLAC_PREFIX_BYTES
    } else {
        non_flac_prefix
    }
}

/// Fingerprint a file from its leading bytes.
///
/// FLAC files are parsed: the `fLaC` marker is checked, the metadata block
/// chain is walked to STREAMINFO, and the embedded audio MD5 plus codec
/// hints are extracted. Other files hash the prefix with SHA-256.
pub fn fingerprint(
    prefix: &[u8],
    path: &str,
) -> Result<(Fingerprint, Option<CodecMeta>), FingerprintError> {
    if is_flac(path) {
        let (md5, meta) = parse_streaminfo(prefix)?;
        Ok((
            Fingerprint::new(FingerprintKind::FlacStreamInfoMd5, md5.to_vec()),
            Some(meta),
        ))
    } else {
        let digest = Sha256::digest(prefix);
        Ok((
            Fingerprint::new(FingerprintKind::Sha256Prefix, digest.to_vec()),
            None,
        ))
    }
}

/// Walk the FLAC metadata block chain and pull the audio MD5 out of
/// STREAMINFO. Block header layout: 1 byte (bit 7 = last-block flag, bits
/// 0..7 = type), 3 bytes big-endian length.
fn parse_streaminfo(prefix: &[u8]) -> Result<([u8; 16], CodecMeta), FingerprintError> {
    if prefix.len() < 4 || &prefix[..4] != FLAC_MARKER {
        return Err(FingerprintError::MalformedHeader(
            "missing fLaC stream marker".into(),
        ));
    }

    let mut pos = 4usize;
    loop {
        let Some(header) = prefix.get(pos..pos + 4) else {
            return Err(FingerprintError::MalformedHeader(
                "truncated metadata block header".into(),
            ));
        };
        let last = header[0] & 0x80 != 0;
        let block_type = header[0] & 0x7f;
        let len = (usize::from(header[1]) << 16) | (usize::from(header[2]) << 8) | usize::from(header[3]);
        if block_type == 0x7f {
            return Err(FingerprintError::MalformedHeader(
                "invalid metadata block type 127".into(),
            ));
        }
        pos += 4;

        if block_type == 0 {
            if len < STREAMINFO_LEN {
                return Err(FingerprintError::MalformedHeader(format!(
                    "STREAMINFO too short: {len} bytes"
                )));
            }
            let Some(body) = prefix.get(pos..pos + STREAMINFO_LEN) else {
                return Err(FingerprintError::MalformedHeader(
                    "truncated STREAMINFO block".into(),
                ));
            };
            return Ok(decode_streaminfo(body));
        }

        pos = pos.checked_add(len).ok_or_else(|| {
            FingerprintError::MalformedHeader("metadata block length overflow".into())
        })?;
        if last {
            return Err(FingerprintError::MalformedHeader(
                "metadata chain ended without STREAMINFO".into(),
            ));
        }
    }
}

fn decode_streaminfo(body: &[u8]) -> ([u8; 16], CodecMeta) {
    // Bytes 10..18 pack sample rate (20 bits), channels-1 (3), bps-1 (5),
    // total samples (36). Bytes 18..34 are the audio MD5.
    let sample_rate = (u32::from(body[10]) << 12) | (u32::from(body[11]) << 4) | (u32::from(body[12]) >> 4);
    let channels = ((body[12] >> 1) & 0x07) + 1;
    let bits_per_sample = (((body[12] & 0x01) << 4) | (body[13] >> 4)) + 1;
    let total_samples = (u64::from(body[13] & 0x0f) << 32)
        | (u64::from(body[14]) << 24)
        | (u64::from(body[15]) << 16)
        | (u64::from(body[16]) << 8)
        | u64::from(body[17]);

    let mut md5 = [0u8; 16];
    md5.copy_from_slice(&body[18..34]);

    (
        md5,
        CodecMeta {
            sample_rate,
            channels,
            bits_per_sample,
            total_samples,
        },
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a minimal valid FLAC prefix: marker + STREAMINFO carrying the
    /// given MD5, preceded by `padding_blocks` PADDING blocks.
    pub(crate) fn flac_prefix(md5: [u8; 16], padding_blocks: usize) -> Vec<u8> {
        let mut out = FLAC_MARKER.to_vec();
        for _ in 0..padding_blocks {
            out.push(0x01); // PADDING, not last
            out.extend_from_slice(&[0, 0, 8]);
            out.extend_from_slice(&[0u8; 8]);
        }
        out.push(0x80); // STREAMINFO, last
        out.extend_from_slice(&[0, 0, 34]);

        let mut body = [0u8; 34];
        body[0] = 0x10; // min blocksize 4096
        body[1] = 0x00;
        body[2] = 0x10;
        body[3] = 0x00;
        // 44100 Hz, 2 channels, 16 bps, 1_000_000 samples
        body[10] = 0x0a;
        body[11] = 0xc4;
        body[12] = 0x42;
        body[13] = 0xf0;
        body[14] = 0x0f;
        body[15] = 0x42;
        body[16] = 0x40;
        body[17] = 0x00;
        body[18..34].copy_from_slice(&md5);
        // total_samples check value below matches these packed bytes
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn test_flac_md5_extraction() {
        let md5 = [0xAB; 16];
        let prefix = flac_prefix(md5, 0);
        let (fp, meta) = fingerprint(&prefix, "song.flac").unwrap();

        assert_eq!(fp.kind, FingerprintKind::FlacStreamInfoMd5);
        assert_eq!(fp.bytes, md5.to_vec());

        let meta = meta.unwrap();
        assert_eq!(meta.sample_rate, 44_100);
        assert_eq!(meta.channels, 2);
        assert_eq!(meta.bits_per_sample, 16);
    }

    #[test]
    fn test_flac_streaminfo_after_padding() {
        let md5 = [0x42; 16];
        let prefix = flac_prefix(md5, 3);
        let (fp, _) = fingerprint(&prefix, "Song.FLAC").unwrap();
        assert_eq!(fp.bytes, md5.to_vec());
    }

    #[test]
    fn test_bad_marker_is_malformed() {
        let err = fingerprint(b"OggS but not flac at all", "x.flac").unwrap_err();
        assert!(matches!(err, FingerprintError::MalformedHeader(_)));
    }

    #[test]
    fn test_truncated_chain_is_malformed() {
        let md5 = [0x01; 16];
        let prefix = flac_prefix(md5, 0);
        let err = fingerprint(&prefix[..10], "x.flac").unwrap_err();
        assert!(matches!(err, FingerprintError::MalformedHeader(_)));
    }

    #[test]
    fn test_sha256_prefix_for_non_flac() {
        let data = b"some mp3-ish bytes";
        let (fp, meta) = fingerprint(data, "track.mp3").unwrap();
        assert_eq!(fp.kind, FingerprintKind::Sha256Prefix);
        assert_eq!(fp.bytes.len(), 32);
        assert!(meta.is_none());

        // Deterministic
        let (fp2, _) = fingerprint(data, "track.mp3").unwrap();
        assert_eq!(fp, fp2);
    }

    #[test]
    fn test_kinds_never_equal() {
        let a = Fingerprint::new(FingerprintKind::FlacStreamInfoMd5, vec![0; 16]);
        let b = Fingerprint::new(FingerprintKind::Sha256Prefix, vec![0; 16]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_minimum_prefix_bytes() {
        assert_eq!(minimum_prefix_bytes("a.flac", 32 * 1024), FLAC_PREFIX_BYTES);
        assert_eq!(minimum_prefix_bytes("a.mp3", 32 * 1024), 32 * 1024);
        assert_eq!(minimum_prefix_bytes("weird", 1000), 1000);
    }

    #[test]
    fn test_meta_flags_roundtrip() {
        let meta = CodecMeta {
            sample_rate: 96_000,
            channels: 2,
            bits_per_sample: 24,
            total_samples: 0,
        };
        let flags = meta.to_flags();
        let back = CodecMeta::from_flags(flags).unwrap();
        assert_eq!(back.sample_rate, 96_000);
        assert_eq!(back.channels, 2);
        assert_eq!(back.bits_per_sample, 24);
        assert_eq!(CodecMeta::from_flags(0), None);
    }

    #[test]
    fn test_fingerprint_from_raw() {
        assert_eq!(
            Fingerprint::from_raw(&[0u8; 16]).unwrap().kind,
            FingerprintKind::FlacStreamInfoMd5
        );
        assert_eq!(
            Fingerprint::from_raw(&[0u8; 32]).unwrap().kind,
            FingerprintKind::Sha256Prefix
        );
        assert!(Fingerprint::from_raw(&[0u8; 20]).is_none());
    }
}
