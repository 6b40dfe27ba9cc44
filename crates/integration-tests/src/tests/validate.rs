//! Integration tests for manifest authentication and fallback classification.

use std::collections::BTreeMap;

use cstor_chunked::footer::{MANIFEST_CHECKSUM_KEY, MANIFEST_INFO_KEY, ZstdChunkedFooterData};
use cstor_chunked::{
    ChunkedError, Digest, ExtractionOptions, ManifestOptions, SeekableFile, extract_blob,
    read_manifest,
};

use crate::fixture::TestLayer;
use crate::integration_test;

fn read(
    layer: &TestLayer,
    annotations: &BTreeMap<String, String>,
    opts: &ManifestOptions,
) -> color_eyre::Result<Result<cstor_chunked::ChunkedManifest, ChunkedError>> {
    let blob = layer.blob()?;
    Ok(read_manifest(&blob, blob.size(), annotations, opts))
}

integration_test!(test_manifest_authenticates, || {
    let layer = TestLayer::sample()?;
    let manifest = read(&layer, layer.annotations(), &ManifestOptions::default())??;

    assert!(manifest.tar_split.is_some());
    let names: Vec<&str> = manifest
        .toc
        .primary_entries()
        .map(|e| e.name.as_str())
        .collect();
    assert!(names.contains(&"usr/bin/hello"));
    assert!(names.contains(&"etc/config"));

    Ok(())
});

integration_test!(test_wrong_toc_digest_is_rejected, || {
    let layer = TestLayer::sample()?;
    let mut annotations = layer.annotations().clone();
    annotations.insert(
        MANIFEST_CHECKSUM_KEY.to_string(),
        Digest::sha256(b"something else").to_string(),
    );

    let err = read(&layer, &annotations, &ManifestOptions::default())?
        .expect_err("wrong digest must fail");
    assert!(
        matches!(err, ChunkedError::DigestMismatch { .. }),
        "unexpected error: {err}"
    );
    assert!(!err.is_fallback());

    Ok(())
});

integration_test!(test_tampered_manifest_is_rejected, || {
    let layer = TestLayer::sample()?;
    let footer = ZstdChunkedFooterData::from_annotations(layer.annotations())?;
    let mut blob = std::fs::read(layer.blob_path())?;
    let pos = (footer.offset + footer.length_compressed / 2) as usize;
    blob[pos] ^= 0xff;
    layer.replace_blob(&blob)?;

    let err = read(&layer, layer.annotations(), &ManifestOptions::default())?
        .expect_err("tampered manifest must fail");
    assert!(
        matches!(err, ChunkedError::DigestMismatch { .. }),
        "unexpected error: {err}"
    );

    Ok(())
});

integration_test!(test_tampered_content_is_rejected, || {
    let layer = TestLayer::sample()?;
    let manifest = read(&layer, layer.annotations(), &ManifestOptions::default())??;
    let entry = manifest
        .toc
        .entries
        .iter()
        .find(|e| e.name == "etc/config")
        .ok_or("etc/config missing from TOC")?;

    // Replace the content frame of etc/config with a valid frame holding
    // different bytes of the same length.
    let frame = zstd::encode_all(&b"key=VALUE\n"[..], 1)?;
    let len = (entry.end_offset - entry.offset) as usize;
    let mut blob = std::fs::read(layer.blob_path())?;
    let start = entry.offset as usize;
    if frame.len() == len {
        blob[start..start + len].copy_from_slice(&frame);
    } else {
        blob[start + len / 2] ^= 0xff;
    }
    layer.replace_blob(&blob)?;

    let (_, dir) = layer.output_dir("rootfs")?;
    let blob = SeekableFile::open(layer.blob_path())?;
    let err = extract_blob(
        &blob,
        blob.size(),
        layer.annotations(),
        &dir,
        &ManifestOptions::default(),
        &ExtractionOptions::default(),
    )
    .expect_err("corrupted content must fail");
    assert!(!err.is_fallback(), "unexpected fallback: {err}");

    Ok(())
});

integration_test!(test_skip_validation_accepts_modified_content, || {
    let layer = TestLayer::sample()?;
    let manifest = read(&layer, layer.annotations(), &ManifestOptions::default())??;
    let entry = manifest
        .toc
        .entries
        .iter()
        .find(|e| e.name == "etc/config")
        .ok_or("etc/config missing from TOC")?
        .clone();

    let frame = zstd::encode_all(&b"key=VALUE\n"[..], 1)?;
    let len = (entry.end_offset - entry.offset) as usize;
    if frame.len() != len {
        eprintln!("skipping: replacement frame has a different size");
        return Ok(());
    }
    let mut blob = std::fs::read(layer.blob_path())?;
    blob[entry.offset as usize..entry.end_offset as usize].copy_from_slice(&frame);
    layer.replace_blob(&blob)?;

    let (path, dir) = layer.output_dir("rootfs")?;
    let blob = layer.blob()?;
    let opts = ExtractionOptions {
        skip_validation: true,
        insecure_allow_unpredictable_image_contents: true,
        ..Default::default()
    };
    extract_blob(
        &blob,
        blob.size(),
        layer.annotations(),
        &dir,
        &ManifestOptions::default(),
        &opts,
    )?;
    assert_eq!(std::fs::read(path.join("etc/config"))?, b"key=VALUE\n");

    Ok(())
});

integration_test!(test_oversized_manifest_is_fallback, || {
    let layer = TestLayer::sample()?;
    let opts = ManifestOptions {
        max_toc_size: 16,
        ..Default::default()
    };
    let err = read(&layer, layer.annotations(), &opts)?.expect_err("limit must apply");
    assert!(
        matches!(err, ChunkedError::TooBig { .. }),
        "unexpected error: {err}"
    );
    assert!(err.is_fallback());
    assert!(!err.can_convert());

    Ok(())
});

integration_test!(test_truncated_blob_is_fallback, || {
    let layer = TestLayer::sample()?;
    let blob = std::fs::read(layer.blob_path())?;
    layer.replace_blob(&blob[..blob.len() / 2])?;

    let err = read(&layer, layer.annotations(), &ManifestOptions::default())?
        .expect_err("ranges past the end must fail");
    assert!(err.is_fallback(), "unexpected error: {err}");
    assert!(err.can_convert());

    Ok(())
});

integration_test!(test_missing_annotations, || {
    let layer = TestLayer::sample()?;
    let mut annotations = layer.annotations().clone();
    annotations.remove(MANIFEST_INFO_KEY);

    let err = read(&layer, &annotations, &ManifestOptions::default())?
        .expect_err("manifest position is required");
    assert!(
        matches!(err, ChunkedError::Format(_)),
        "unexpected error: {err}"
    );

    Ok(())
});
