//! Output formatting utilities for the CLI.
//!
//! Commands print either a human-readable table or JSON. Tables are built
//! from the serde representation of the output types, so a type only needs
//! `Serialize` to be printable both ways: struct fields become rows (for a
//! single item) or columns (for a slice), and integer fields whose name ends
//! in `size` or starts with `bytes` are shown as human-readable sizes.

use clap::ValueEnum;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use serde::Serialize;
use serde_json::Value;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// Machine-parseable JSON format.
    Json,
}

/// One TOC entry as shown by `inspect`.
#[derive(Debug, Serialize)]
pub struct TocEntryRow {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub name: String,
    pub mode: String,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Number of chunks the content is split into.
    pub chunks: usize,
    /// Shortened content digest.
    pub digest: String,
}

/// Decoded zstd:chunked footer.
#[derive(Debug, Serialize)]
pub struct FooterOutput {
    pub manifest_type: u64,
    pub manifest_offset: u64,
    pub manifest_compressed_size: u64,
    pub manifest_uncompressed_size: u64,
    pub tar_split_offset: u64,
    pub tar_split_compressed_size: u64,
    pub tar_split_uncompressed_size: u64,
}

/// Result of `convert`.
#[derive(Debug, Serialize)]
pub struct ConvertOutput {
    pub toc_digest: String,
    pub diff_id: String,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
}

/// Result of `extract`.
#[derive(Debug, Serialize)]
pub struct ExtractOutput {
    pub files_extracted: usize,
    pub directories_created: usize,
    pub symlinks_created: usize,
    pub hardlinks_created: usize,
    pub devices_created: usize,
    pub whiteouts_processed: usize,
    pub files_deduplicated: usize,
    pub files_reused: usize,
    pub chunks_reused: usize,
    pub bytes_fetched: u64,
    pub bytes_sparse: u64,
    pub bytes_reflinked: u64,
    pub bytes_hardlinked: u64,
    pub bytes_copied: u64,
    pub bytes_reused: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncompressed_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncompressed_size: Option<u64>,
}

/// Format a byte count as human-readable size.
///
/// Uses binary units with one decimal place.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(format_size(512), "512 B");
/// assert_eq!(format_size(1536), "1.5 KB");
/// ```
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Shorten a `algorithm:hex` digest to its first 12 hex characters.
pub fn truncate_digest(digest: &str) -> String {
    let hex = digest.split_once(':').map(|(_, h)| h).unwrap_or(digest);
    if hex.len() <= 12 {
        hex.to_string()
    } else {
        hex[..12].to_string()
    }
}

/// Create a styled table with consistent formatting.
pub fn create_styled_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn is_size_field(key: &str) -> bool {
    key.ends_with("size") || key.starts_with("bytes")
}

fn cell(key: &str, v: &Value) -> String {
    match v {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) if is_size_field(key) => match n.as_u64() {
            Some(n) => format_size(n),
            None => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn header(key: &str) -> String {
    key.replace('_', " ").to_uppercase()
}

fn table_from_item(item: &Value) -> Table {
    let mut table = create_styled_table();
    if let Value::Object(map) = item {
        for (k, v) in map {
            table.add_row(vec![header(k), cell(k, v)]);
        }
    }
    table
}

fn table_from_slice(items: &[Value]) -> Table {
    let mut table = create_styled_table();
    let Some(Value::Object(first)) = items.first() else {
        return table;
    };
    let keys: Vec<&String> = first.keys().collect();
    table.set_header(keys.iter().map(|k| header(k)));
    for item in items {
        if let Value::Object(map) = item {
            table.add_row(
                keys.iter()
                    .map(|k| map.get(*k).map(|v| cell(k, v)).unwrap_or_default()),
            );
        }
    }
    table
}

/// Output a single item in the specified format.
pub fn output_item<T: Serialize>(item: &T, format: OutputFormat) -> Result<(), serde_json::Error> {
    let value = serde_json::to_value(item)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&value)?),
        OutputFormat::Table => println!("{}", table_from_item(&value)),
    }
    Ok(())
}

/// Output a slice of items in the specified format.
pub fn output_slice<T: Serialize>(
    items: &[T],
    format: OutputFormat,
) -> Result<(), serde_json::Error> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(items)?),
        OutputFormat::Table => {
            let values = items
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?;
            println!("{}", table_from_slice(&values));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1024 * 1024), "1.0 MB");
        assert_eq!(format_size(2_500_000_000), "2.3 GB");
    }

    #[test]
    fn test_truncate_digest() {
        assert_eq!(truncate_digest(""), "");
        assert_eq!(
            truncate_digest("sha256:0123456789abcdef0123456789abcdef"),
            "0123456789ab"
        );
        assert_eq!(truncate_digest("abc"), "abc");
    }

    #[test]
    fn test_item_table() {
        let out = FooterOutput {
            manifest_type: 1,
            manifest_offset: 10,
            manifest_compressed_size: 2048,
            manifest_uncompressed_size: 4096,
            tar_split_offset: 0,
            tar_split_compressed_size: 0,
            tar_split_uncompressed_size: 0,
        };
        let table = table_from_item(&serde_json::to_value(&out).unwrap()).to_string();
        assert!(table.contains("MANIFEST OFFSET"), "{table}");
        assert!(table.contains("2.0 KB"), "{table}");
    }

    #[test]
    fn test_slice_table() {
        let rows = vec![TocEntryRow {
            entry_type: "reg".into(),
            name: "usr/bin/hello".into(),
            mode: "0755".into(),
            uid: 0,
            gid: 0,
            size: 5,
            chunks: 1,
            digest: "abcdef012345".into(),
        }];
        let values: Vec<Value> = rows.iter().map(|r| serde_json::to_value(r).unwrap()).collect();
        let table = table_from_slice(&values).to_string();
        assert!(table.contains("TYPE"), "{table}");
        assert!(table.contains("usr/bin/hello"), "{table}");
        assert!(table.contains("5 B"), "{table}");
    }
}
