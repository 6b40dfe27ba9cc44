//! CLI integration tests.
//!
//! These drive the `cstor-chunked` binary with xshell against blobs built
//! by the fixtures. The binary must have been built beforehand.

use std::collections::BTreeMap;
use std::path::PathBuf;

use xshell::{Shell, cmd};

use cstor_chunked::Toc;
use cstor_chunked::tar_split_writer::tar_split_from_tar;

use crate::fixture::{TestLayer, workspace_root};
use crate::integration_test;

/// Get the path to the cstor-chunked binary.
fn cstor_binary() -> color_eyre::Result<PathBuf> {
    let root = workspace_root();
    for profile in ["debug", "release"] {
        let path = root.join("target").join(profile).join("cstor-chunked");
        if path.exists() {
            return Ok(path);
        }
    }
    color_eyre::eyre::bail!("cstor-chunked binary not found. Run `cargo build` first.")
}

fn shell() -> color_eyre::Result<Shell> {
    let sh = Shell::new()?;
    // Keep the host configuration out of the tests.
    sh.set_var("CONTAINERS_STORAGE_CONF", "/dev/null");
    Ok(sh)
}

integration_test!(test_cli_convert_and_inspect, || {
    let layer = TestLayer::sample()?;
    let sh = shell()?;
    let bin = cstor_binary()?;
    let tar = layer.tar_path();
    let blob = layer.path().join("cli.zst");
    let ann = layer.path().join("cli-annotations.json");

    let out = cmd!(
        sh,
        "{bin} convert {tar} {blob} --annotations-out {ann} --format json"
    )
    .read()?;
    let converted: BTreeMap<String, serde_json::Value> = serde_json::from_str(&out)?;
    assert_eq!(
        converted["diff_id"].as_str(),
        Some(layer.converted.diff_id.to_string().as_str())
    );

    let toc = cmd!(sh, "{bin} inspect {blob} --annotations {ann} --format json").read()?;
    let toc: Toc = serde_json::from_str(&toc)?;
    assert!(toc.entries.iter().any(|e| e.name == "usr/bin/hello"));

    let table = cmd!(sh, "{bin} inspect {blob} --annotations {ann}").read()?;
    assert!(table.contains("usr/sparse"), "{table}");

    Ok(())
});

integration_test!(test_cli_footer, || {
    let layer = TestLayer::sample()?;
    let sh = shell()?;
    let bin = cstor_binary()?;
    let blob = layer.blob_path();

    let out = cmd!(sh, "{bin} footer {blob} --format json").read()?;
    let footer: BTreeMap<String, u64> = serde_json::from_str(&out)?;
    assert_eq!(footer["manifest_type"], 1);
    assert!(footer["tar_split_offset"] > 0);

    Ok(())
});

integration_test!(test_cli_extract, || {
    let layer = TestLayer::sample()?;
    let sh = shell()?;
    let bin = cstor_binary()?;
    let blob = layer.blob_path();
    let ann = layer.annotations_path();
    let dest = layer.path().join("rootfs");

    let out = cmd!(
        sh,
        "{bin} extract {blob} {dest} --annotations {ann} --use-hard-links --format json"
    )
    .read()?;
    let stats: serde_json::Value = serde_json::from_str(&out)?;
    assert_eq!(
        stats["uncompressed_digest"].as_str(),
        Some(layer.converted.diff_id.to_string().as_str())
    );
    assert_eq!(stats["files_deduplicated"].as_u64(), Some(1));
    assert_eq!(
        std::fs::read(dest.join("usr/bin/hello"))?,
        b"#!/bin/sh\necho hello\n"
    );

    Ok(())
});

integration_test!(test_cli_extract_from_footer, || {
    let layer = TestLayer::sample()?;
    let sh = shell()?;
    let bin = cstor_binary()?;
    let blob = layer.blob_path();
    let dest = layer.path().join("rootfs");

    cmd!(sh, "{bin} extract {blob} {dest} --force-copy").run()?;
    assert_eq!(std::fs::read(dest.join("etc/config"))?, b"key=value\n");

    Ok(())
});

integration_test!(test_cli_extract_reuse_from, || {
    let layer = TestLayer::sample()?;
    let sh = shell()?;
    let bin = cstor_binary()?;
    let blob = layer.blob_path();
    let ann = layer.annotations_path();
    let first = layer.path().join("rootfs");
    let second = layer.path().join("rootfs2");

    cmd!(sh, "{bin} extract {blob} {first} --annotations {ann} --force-copy").run()?;
    let out = cmd!(
        sh,
        "{bin} extract {blob} {second} --annotations {ann} --reuse-from {first} --format json"
    )
    .read()?;
    let stats: serde_json::Value = serde_json::from_str(&out)?;
    assert!(stats["files_reused"].as_u64().unwrap_or(0) > 0, "{out}");
    assert!(stats["bytes_reused"].as_u64().unwrap_or(0) > 0, "{out}");
    assert_eq!(
        stats["uncompressed_digest"].as_str(),
        Some(layer.converted.diff_id.to_string().as_str())
    );
    assert_eq!(std::fs::read(second.join("etc/config"))?, b"key=value\n");

    Ok(())
});

integration_test!(test_cli_fallback_exit_code, || {
    let layer = TestLayer::sample()?;
    let sh = shell()?;
    let bin = cstor_binary()?;
    let blob = layer.blob_path();
    let ann = layer.annotations_path();
    let dest = layer.path().join("rootfs");

    let conf = layer.path().join("storage.conf");
    std::fs::write(
        &conf,
        "[storage.options.pull_options]\nmax_toc_size = \"16\"\n",
    )?;
    let output = cmd!(sh, "{bin} extract {blob} {dest} --annotations {ann}")
        .env("CONTAINERS_STORAGE_CONF", &conf)
        .ignore_status()
        .output()?;
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("too big"), "{stderr}");

    let garbage = layer.path().join("garbage");
    std::fs::write(&garbage, [0u8; 128])?;
    let output = cmd!(sh, "{bin} footer {garbage}").ignore_status().output()?;
    assert_eq!(output.status.code(), Some(1));

    Ok(())
});

integration_test!(test_cli_tar_size, || {
    let layer = TestLayer::sample()?;
    let sh = shell()?;
    let bin = cstor_binary()?;

    let ndjson = tar_split_from_tar(&layer.tar[..])?;
    let plain = layer.path().join("tar-split.json");
    let compressed = layer.path().join("tar-split.json.zst");
    std::fs::write(&plain, &ndjson)?;
    std::fs::write(&compressed, zstd::encode_all(&ndjson[..], 1)?)?;

    let expected = layer.tar.len().to_string();
    assert_eq!(cmd!(sh, "{bin} tar-size {plain}").read()?, expected);
    assert_eq!(cmd!(sh, "{bin} tar-size {compressed}").read()?, expected);

    Ok(())
});

integration_test!(test_cli_dump, || {
    let layer = TestLayer::sample()?;
    let sh = shell()?;
    let bin = cstor_binary()?;
    let blob = layer.blob_path();
    let ann = layer.annotations_path();

    let out = cmd!(sh, "{bin} dump {blob} --annotations {ann}").read()?;
    let lines: Vec<&str> = out.lines().collect();
    assert!(lines[0].starts_with("/ 0 40755 "), "{out}");
    let hello = lines
        .iter()
        .find(|l| l.starts_with("/usr/bin/hello "))
        .ok_or("no line for /usr/bin/hello")?;
    // Two names share the inode: hello and hello-link.
    assert!(hello.contains(" 100755 2 "), "{hello}");
    assert!(
        lines
            .iter()
            .any(|l| l.starts_with("/usr/bin/hello-link ") && l.contains(" @100644 ")),
        "{out}"
    );

    Ok(())
});
