//! zstd:chunked blob trailer: skippable frames, the 64-byte footer and the
//! layer annotations that locate the manifest and tar-split.
//!
//! A zstd:chunked blob ends with three zstd skippable frames:
//!
//! ```text
//! [compressed tar stream][manifest frame][tar-split frame][footer frame]
//! ```
//!
//! Ordinary zstd decoders skip them, so the blob still decompresses to the
//! original tar stream. The footer makes the blob self-describing, but readers
//! locate the manifest through the annotations since those are covered by the
//! image manifest digest.

use std::collections::BTreeMap;
use std::io::Write;

use crate::digest::Digest;
use crate::error::{ChunkedError, Result};
use crate::toc::{FileMetadata, Toc};

/// Annotation holding the digest of the compressed manifest.
pub const MANIFEST_CHECKSUM_KEY: &str = "io.github.containers.zstd-chunked.manifest-checksum";

/// Annotation `offset:length:uncompressed_length:type` of the manifest frame.
pub const MANIFEST_INFO_KEY: &str = "io.github.containers.zstd-chunked.manifest-position";

/// Annotation `offset:length:uncompressed_length` of the tar-split frame.
pub const TAR_SPLIT_INFO_KEY: &str = "io.github.containers.zstd-chunked.tarsplit-position";

/// The only manifest type understood: a CRFS compatible TOC.
pub const MANIFEST_TYPE_CRFS: u64 = 1;

/// Size of the footer payload.
pub const FOOTER_SIZE_SUPPORTED: usize = 64;

/// Magic trailer of the footer payload.
pub const ZSTD_CHUNKED_FRAME_MAGIC: [u8; 8] = [0x47, 0x4e, 0x55, 0x6c, 0x49, 0x6e, 0x55, 0x78];

/// Magic of a zstd skippable frame; zstd decoders ignore such frames.
pub const SKIPPABLE_FRAME_MAGIC: [u8; 4] = [0x50, 0x2a, 0x4d, 0x18];

/// Size of the skippable frame header (magic plus 32-bit length).
pub const SKIPPABLE_FRAME_HEADER_SIZE: u64 = 8;

/// Contents of the 64-byte footer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZstdChunkedFooterData {
    /// Manifest type, [`MANIFEST_TYPE_CRFS`].
    pub manifest_type: u64,
    /// Offset of the compressed manifest in the blob.
    pub offset: u64,
    /// Compressed manifest length.
    pub length_compressed: u64,
    /// Uncompressed manifest length.
    pub length_uncompressed: u64,
    /// Offset of the compressed tar-split; 0 if there is none.
    pub offset_tar_split: u64,
    /// Compressed tar-split length.
    pub length_compressed_tar_split: u64,
    /// Uncompressed tar-split length.
    pub length_uncompressed_tar_split: u64,
}

impl ZstdChunkedFooterData {
    /// Encode as 7 little-endian u64 followed by the magic.
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE_SUPPORTED] {
        let mut out = [0u8; FOOTER_SIZE_SUPPORTED];
        let fields = [
            self.offset,
            self.length_compressed,
            self.length_uncompressed,
            self.manifest_type,
            self.offset_tar_split,
            self.length_compressed_tar_split,
            self.length_uncompressed_tar_split,
        ];
        for (slot, v) in out.chunks_exact_mut(8).zip(fields) {
            slot.copy_from_slice(&v.to_le_bytes());
        }
        out[56..].copy_from_slice(&ZSTD_CHUNKED_FRAME_MAGIC);
        out
    }

    /// Decode a footer payload. Anything other than exactly the supported
    /// size with a valid magic is rejected.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let data: &[u8; FOOTER_SIZE_SUPPORTED] = data.try_into().map_err(|_| {
            ChunkedError::Format(format!(
                "footer has {} bytes, expected {FOOTER_SIZE_SUPPORTED}",
                data.len()
            ))
        })?;
        if data[56..] != ZSTD_CHUNKED_FRAME_MAGIC {
            return Err(ChunkedError::Format("invalid magic number".to_string()));
        }
        let field = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[i * 8..i * 8 + 8]);
            u64::from_le_bytes(b)
        };
        Ok(Self {
            offset: field(0),
            length_compressed: field(1),
            length_uncompressed: field(2),
            manifest_type: field(3),
            offset_tar_split: field(4),
            length_compressed_tar_split: field(5),
            length_uncompressed_tar_split: field(6),
        })
    }

    /// Read the manifest and tar-split positions from layer annotations.
    ///
    /// The manifest position is required; the tar-split position is optional
    /// and leaves the tar-split fields at zero when absent.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Result<Self> {
        let manifest = annotations.get(MANIFEST_INFO_KEY).ok_or_else(|| {
            ChunkedError::Format(format!("{MANIFEST_INFO_KEY:?} annotation missing"))
        })?;
        let [offset, length_compressed, length_uncompressed, manifest_type] =
            parse_position::<4>(MANIFEST_INFO_KEY, manifest)?;
        let mut footer = Self {
            manifest_type,
            offset,
            length_compressed,
            length_uncompressed,
            ..Default::default()
        };
        if let Some(tar_split) = annotations.get(TAR_SPLIT_INFO_KEY) {
            let [o, c, u] = parse_position::<3>(TAR_SPLIT_INFO_KEY, tar_split)?;
            footer.offset_tar_split = o;
            footer.length_compressed_tar_split = c;
            footer.length_uncompressed_tar_split = u;
        }
        Ok(footer)
    }
}

fn parse_position<const N: usize>(key: &str, value: &str) -> Result<[u64; N]> {
    let bad = || ChunkedError::Format(format!("parse {key:?} annotation {value:?}"));
    let mut out = [0u64; N];
    let mut parts = value.split(':');
    for slot in &mut out {
        *slot = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    }
    if parts.next().is_some() {
        return Err(bad());
    }
    Ok(out)
}

/// Write `data` wrapped in a zstd skippable frame.
pub fn append_skippable_frame<W: Write + ?Sized>(dest: &mut W, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| ChunkedError::TooBig {
        what: "skippable frame".to_string(),
        size: data.len() as u64,
        limit: u32::MAX as u64,
    })?;
    dest.write_all(&SKIPPABLE_FRAME_MAGIC)?;
    dest.write_all(&len.to_le_bytes())?;
    dest.write_all(data)?;
    Ok(())
}

/// Compressed tar-split stream to embed in a zstd:chunked blob.
#[derive(Debug, Clone)]
pub struct TarSplitData {
    /// zstd-compressed NDJSON tar-split.
    pub data: Vec<u8>,
    /// Digest of `data`.
    pub digest: Digest,
    /// Length of the NDJSON before compression.
    pub uncompressed_size: u64,
}

/// Append the manifest, tar-split and footer frames of a zstd:chunked blob.
///
/// `offset` is the number of bytes already written to the blob. The
/// position and checksum annotations are inserted into `annotations`. Returns
/// the digest of the compressed manifest, which is the TOC digest callers must
/// record to allow partial pulls.
pub fn write_zstd_chunked_manifest<W: Write + ?Sized>(
    dest: &mut W,
    annotations: &mut BTreeMap<String, String>,
    offset: u64,
    tar_split: &TarSplitData,
    entries: Vec<FileMetadata>,
    level: i32,
) -> Result<Digest> {
    let manifest_offset = offset + SKIPPABLE_FRAME_HEADER_SIZE;

    let toc = Toc {
        version: 1,
        entries,
        tar_split_digest: Some(tar_split.digest.clone()),
    };
    let manifest = toc.to_vec()?;
    let compressed = zstd::encode_all(&manifest[..], level)?;
    let checksum = Digest::sha256(&compressed);

    annotations.insert(MANIFEST_CHECKSUM_KEY.to_string(), checksum.to_string());
    annotations.insert(
        MANIFEST_INFO_KEY.to_string(),
        format!(
            "{manifest_offset}:{}:{}:{MANIFEST_TYPE_CRFS}",
            compressed.len(),
            manifest.len()
        ),
    );
    append_skippable_frame(dest, &compressed)?;

    let tar_split_offset = manifest_offset + compressed.len() as u64 + SKIPPABLE_FRAME_HEADER_SIZE;
    annotations.insert(
        TAR_SPLIT_INFO_KEY.to_string(),
        format!(
            "{tar_split_offset}:{}:{}",
            tar_split.data.len(),
            tar_split.uncompressed_size
        ),
    );
    append_skippable_frame(dest, &tar_split.data)?;

    let footer = ZstdChunkedFooterData {
        manifest_type: MANIFEST_TYPE_CRFS,
        offset: manifest_offset,
        length_compressed: compressed.len() as u64,
        length_uncompressed: manifest.len() as u64,
        offset_tar_split: tar_split_offset,
        length_compressed_tar_split: tar_split.data.len() as u64,
        length_uncompressed_tar_split: tar_split.uncompressed_size,
    };
    append_skippable_frame(dest, &footer.to_bytes())?;
    Ok(checksum)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ZstdChunkedFooterData {
        ZstdChunkedFooterData {
            manifest_type: MANIFEST_TYPE_CRFS,
            offset: 1,
            length_compressed: 2,
            length_uncompressed: 3,
            offset_tar_split: 4,
            length_compressed_tar_split: 5,
            length_uncompressed_tar_split: 6,
        }
    }

    #[test]
    fn test_footer_roundtrip() {
        let f = sample();
        let bytes = f.to_bytes();
        assert_eq!(bytes.len(), FOOTER_SIZE_SUPPORTED);
        assert_eq!(&bytes[24..32], &1u64.to_le_bytes());
        assert_eq!(ZstdChunkedFooterData::from_bytes(&bytes).unwrap(), f);
    }

    #[test]
    fn test_footer_short_or_bad_magic() {
        let bytes = sample().to_bytes();
        let err = ZstdChunkedFooterData::from_bytes(&bytes[..63]).unwrap_err();
        assert!(matches!(err, ChunkedError::Format(_)));

        let mut bad = bytes;
        bad[63] ^= 0xff;
        let err = ZstdChunkedFooterData::from_bytes(&bad).unwrap_err();
        assert!(matches!(err, ChunkedError::Format(_)));
    }

    #[test]
    fn test_skippable_frame_layout() {
        let mut out = Vec::new();
        append_skippable_frame(&mut out, b"abc").unwrap();
        assert_eq!(out, [0x50, 0x2a, 0x4d, 0x18, 3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_skippable_frames_are_ignored_by_zstd() {
        let mut blob = zstd::encode_all(&b"payload"[..], 3).unwrap();
        append_skippable_frame(&mut blob, b"metadata").unwrap();
        assert_eq!(zstd::decode_all(&blob[..]).unwrap(), b"payload");
    }

    #[test]
    fn test_annotation_parsing() {
        let mut a = BTreeMap::new();
        assert!(ZstdChunkedFooterData::from_annotations(&a).is_err());

        a.insert(MANIFEST_INFO_KEY.to_string(), "10:20:30:1".to_string());
        let f = ZstdChunkedFooterData::from_annotations(&a).unwrap();
        assert_eq!(
            (f.offset, f.length_compressed, f.length_uncompressed, f.manifest_type),
            (10, 20, 30, 1)
        );
        assert_eq!(f.offset_tar_split, 0);

        a.insert(TAR_SPLIT_INFO_KEY.to_string(), "40:50:60".to_string());
        let f = ZstdChunkedFooterData::from_annotations(&a).unwrap();
        assert_eq!(
            (
                f.offset_tar_split,
                f.length_compressed_tar_split,
                f.length_uncompressed_tar_split
            ),
            (40, 50, 60)
        );

        a.insert(TAR_SPLIT_INFO_KEY.to_string(), "40:50".to_string());
        assert!(ZstdChunkedFooterData::from_annotations(&a).is_err());
        a.insert(MANIFEST_INFO_KEY.to_string(), "10:x:30:1".to_string());
        assert!(ZstdChunkedFooterData::from_annotations(&a).is_err());
    }

    #[test]
    fn test_write_manifest_positions() {
        let prefix = zstd::encode_all(&b"tar data"[..], 3).unwrap();
        let ts_data = zstd::encode_all(&b"{\"type\":2}\n"[..], 3).unwrap();
        let tar_split = TarSplitData {
            digest: Digest::sha256(&ts_data),
            uncompressed_size: 11,
            data: ts_data,
        };
        let mut blob = prefix.clone();
        let mut annotations = BTreeMap::new();
        let toc_digest = write_zstd_chunked_manifest(
            &mut blob,
            &mut annotations,
            prefix.len() as u64,
            &tar_split,
            vec![],
            3,
        )
        .unwrap();

        let f = ZstdChunkedFooterData::from_annotations(&annotations).unwrap();
        let manifest =
            &blob[f.offset as usize..(f.offset + f.length_compressed) as usize];
        assert_eq!(Digest::sha256(manifest), toc_digest);
        assert_eq!(annotations[MANIFEST_CHECKSUM_KEY], toc_digest.to_string());
        let toc = Toc::from_slice(&zstd::decode_all(manifest).unwrap()).unwrap();
        assert_eq!(toc.tar_split_digest.as_ref(), Some(&tar_split.digest));

        let ts = &blob[f.offset_tar_split as usize
            ..(f.offset_tar_split + f.length_compressed_tar_split) as usize];
        assert_eq!(ts, &tar_split.data[..]);

        let footer = ZstdChunkedFooterData::from_bytes(&blob[blob.len() - 64..]).unwrap();
        assert_eq!(footer, f);
        assert_eq!(&blob[blob.len() - 72..blob.len() - 68], &SKIPPABLE_FRAME_MAGIC);

        assert_eq!(zstd::decode_all(&blob[..]).unwrap(), b"tar data");
    }
}
