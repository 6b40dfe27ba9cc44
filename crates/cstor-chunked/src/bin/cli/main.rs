//! cstor-chunked: command-line tool for zstd:chunked and estargz layers
//!
//! This binary exposes the cstor-chunked library on local blob files and
//! doubles as the driver for the integration tests.
//!
//! # Annotations
//!
//! Reading a chunked layer needs the layer annotations from the image
//! manifest, most importantly the TOC digest. Commands accept them as a JSON
//! object with `--annotations`. Without one, the annotations of a
//! zstd:chunked blob are rebuilt from its footer and the TOC digest is
//! computed from the blob itself, which trusts the blob. For estargz blobs,
//! pass `--toc-digest`.
//!
//! # Exit status
//!
//! Errors that mean "retry with a regular full download" exit with status 2,
//! every other error with status 1.
//!
//! Example usage:
//! ```bash
//! cstor-chunked convert layer.tar layer.zst --annotations-out ann.json
//! cstor-chunked inspect layer.zst --annotations ann.json
//! cstor-chunked extract layer.zst ./rootfs --annotations ann.json
//! ```

mod output;

use anyhow::{Context, Result, anyhow};
use cap_std::ambient_authority;
use cap_std::fs::Dir;
use clap::{Parser, Subcommand, ValueEnum};
use cstor_chunked::compressor::{
    CompressorOptions, DEFAULT_CHUNK_SIZE, DEFAULT_COMPRESSION_LEVEL, compress_tar,
};
use cstor_chunked::dump::generate_dump;
use cstor_chunked::footer::{
    FOOTER_SIZE_SUPPORTED, MANIFEST_CHECKSUM_KEY, MANIFEST_INFO_KEY, TAR_SPLIT_INFO_KEY,
    ZstdChunkedFooterData,
};
use cstor_chunked::fs::WhiteoutFormat;
use cstor_chunked::manifest::ESTARGZ_TOC_DIGEST_KEY;
use cstor_chunked::tar_split::tar_size_from_tar_split;
use cstor_chunked::*;
use output::{
    ConvertOutput, ExtractOutput, FooterOutput, OutputFormat, TocEntryRow, output_item,
    output_slice, truncate_digest,
};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Exit status for errors that allow falling back to a full download.
const EXIT_FALLBACK: u8 = 2;

/// First bytes of a zstd frame.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Parser)]
#[command(name = "cstor-chunked")]
#[command(about = "Partial-pull codec for zstd:chunked and estargz layers", long_about = None)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where the layer annotations come from.
#[derive(clap::Args)]
struct LayerArgs {
    /// Blob file
    blob: PathBuf,
    /// JSON file holding the layer annotations
    #[arg(long)]
    annotations: Option<PathBuf>,
    /// Trusted TOC digest, overriding the annotations
    #[arg(long)]
    toc_digest: Option<Digest>,
}

#[derive(Clone, Copy, ValueEnum)]
enum WhiteoutArg {
    /// Keep `.wh.*` files as they are
    Aufs,
    /// Convert whiteouts to overlay character devices and xattrs
    Overlay,
}

impl From<WhiteoutArg> for WhiteoutFormat {
    fn from(v: WhiteoutArg) -> Self {
        match v {
            WhiteoutArg::Aufs => WhiteoutFormat::Aufs,
            WhiteoutArg::Overlay => WhiteoutFormat::Overlay,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the TOC of a chunked blob
    Inspect {
        #[command(flatten)]
        layer: LayerArgs,
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Decode the zstd:chunked footer of a blob
    Footer {
        /// Blob file
        blob: PathBuf,
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Convert a tarball into a zstd:chunked blob
    Convert {
        /// Input tarball, `-` for stdin
        input: PathBuf,
        /// Output blob
        output: PathBuf,
        /// zstd compression level
        #[arg(long, default_value_t = DEFAULT_COMPRESSION_LEVEL)]
        level: i32,
        /// Maximum uncompressed chunk size in bytes
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,
        /// Write the layer annotations as JSON to this file
        #[arg(long)]
        annotations_out: Option<PathBuf>,
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Materialize a chunked blob into a directory
    Extract {
        #[command(flatten)]
        layer: LayerArgs,
        /// Destination directory, created if missing
        output: PathBuf,
        /// Hard link duplicate files with identical metadata
        #[arg(long)]
        use_hard_links: bool,
        /// Always copy duplicate files instead of trying reflinks
        #[arg(long)]
        force_copy: bool,
        /// Do not verify file digests
        #[arg(long)]
        skip_validation: bool,
        /// Ignore chown failures
        #[arg(long)]
        ignore_chown_errors: bool,
        /// How whiteouts are written
        #[arg(long, value_enum, default_value = "aufs")]
        whiteout_format: WhiteoutArg,
        /// Skip computing the uncompressed digest
        #[arg(long)]
        insecure_allow_unpredictable_image_contents: bool,
        /// Reuse file content from an already extracted tree (repeatable)
        #[arg(long, value_name = "DIR")]
        reuse_from: Vec<PathBuf>,
        /// Reuse file content from an OSTree repository (repeatable)
        #[arg(long, value_name = "DIR")]
        ostree_repo: Vec<PathBuf>,
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Print the size of the tarball described by a tar-split
    TarSize {
        /// Tar-split file, plain or zstd-compressed
        tar_split: PathBuf,
    },

    /// Print the TOC of a chunked blob in composefs dump format
    Dump {
        #[command(flatten)]
        layer: LayerArgs,
        /// JSON object mapping payload paths to fs-verity digests
        #[arg(long)]
        verity_digests: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let fallback = e
                .chain()
                .filter_map(|c| c.downcast_ref::<ChunkedError>())
                .any(ChunkedError::is_fallback);
            if fallback {
                ExitCode::from(EXIT_FALLBACK)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Inspect { layer, format } => inspect(&layer, format)?,
        Commands::Footer { blob, format } => footer(&blob, format)?,
        Commands::Convert {
            input,
            output,
            level,
            chunk_size,
            annotations_out,
            format,
        } => convert(
            &input,
            &output,
            &CompressorOptions { level, chunk_size },
            annotations_out.as_deref(),
            format,
        )?,
        Commands::Extract {
            layer,
            output,
            use_hard_links,
            force_copy,
            skip_validation,
            ignore_chown_errors,
            whiteout_format,
            insecure_allow_unpredictable_image_contents,
            reuse_from,
            ostree_repo,
            format,
        } => {
            let mut config =
                PullOptions::load().context("Failed to load storage configuration")?;
            config.ostree_repos.extend(ostree_repo);
            let mut opts = config.extraction_options();
            opts.use_hard_links |= use_hard_links;
            opts.ignore_chown_errors |= ignore_chown_errors;
            opts.insecure_allow_unpredictable_image_contents |=
                insecure_allow_unpredictable_image_contents;
            opts.skip_validation = skip_validation;
            opts.whiteout_format = whiteout_format.into();
            if force_copy {
                opts.link_mode = LinkMode::Copy;
            }
            let cache = layer_cache(&config, &reuse_from)?;
            if !cache.is_empty() {
                opts.layer_cache = Some(Arc::new(cache));
            }
            extract(&layer, &output, &config.manifest_options(), &opts, format)?
        }
        Commands::TarSize { tar_split } => tar_size(&tar_split)?,
        Commands::Dump {
            layer,
            verity_digests,
        } => dump(&layer, verity_digests.as_deref())?,
    }
    Ok(())
}

fn read_json_map(path: &Path) -> Result<BTreeMap<String, String>> {
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("Failed to parse {}", path.display()))
}

fn read_footer(file: &File, size: u64) -> Result<ZstdChunkedFooterData> {
    let len = FOOTER_SIZE_SUPPORTED as u64;
    if size < len {
        return Err(ChunkedError::Format(format!("blob of {size} bytes has no footer")).into());
    }
    let mut buf = [0u8; FOOTER_SIZE_SUPPORTED];
    file.read_exact_at(&mut buf, size - len)
        .context("Failed to read footer")?;
    Ok(ZstdChunkedFooterData::from_bytes(&buf)?)
}

/// Rebuild the annotations of a zstd:chunked blob from its footer. The TOC
/// digest is taken from the blob, so the result authenticates nothing.
fn annotations_from_footer(path: &Path) -> Result<BTreeMap<String, String>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let size = file.metadata()?.len();
    let footer = read_footer(&file, size)?;

    let mut manifest = vec![0u8; usize::try_from(footer.length_compressed)?];
    file.read_exact_at(&mut manifest, footer.offset)
        .context("Failed to read manifest")?;
    tracing::warn!("no annotations given; trusting the TOC digest computed from the blob");

    let mut annotations = BTreeMap::new();
    annotations.insert(
        MANIFEST_CHECKSUM_KEY.to_string(),
        Digest::sha256(&manifest).to_string(),
    );
    annotations.insert(
        MANIFEST_INFO_KEY.to_string(),
        format!(
            "{}:{}:{}:{}",
            footer.offset,
            footer.length_compressed,
            footer.length_uncompressed,
            footer.manifest_type
        ),
    );
    if footer.offset_tar_split > 0 {
        annotations.insert(
            TAR_SPLIT_INFO_KEY.to_string(),
            format!(
                "{}:{}:{}",
                footer.offset_tar_split,
                footer.length_compressed_tar_split,
                footer.length_uncompressed_tar_split
            ),
        );
    }
    Ok(annotations)
}

/// Collect the annotations for a layer from the command line.
fn layer_annotations(layer: &LayerArgs) -> Result<BTreeMap<String, String>> {
    let mut annotations = match (&layer.annotations, &layer.toc_digest) {
        (Some(path), _) => read_json_map(path)?,
        (None, Some(_)) => match annotations_from_footer(&layer.blob) {
            Ok(a) => a,
            // No zstd:chunked footer; assume estargz.
            Err(_) => BTreeMap::new(),
        },
        (None, None) => annotations_from_footer(&layer.blob)?,
    };
    if let Some(digest) = &layer.toc_digest {
        let key = if annotations.contains_key(MANIFEST_INFO_KEY) {
            MANIFEST_CHECKSUM_KEY
        } else {
            ESTARGZ_TOC_DIGEST_KEY
        };
        annotations.insert(key.to_string(), digest.to_string());
    }
    Ok(annotations)
}

fn open_layer(
    layer: &LayerArgs,
    opts: &ManifestOptions,
) -> Result<(SeekableFile, ChunkedManifest)> {
    let blob = SeekableFile::open(&layer.blob)
        .with_context(|| format!("Failed to open {}", layer.blob.display()))?;
    let annotations = layer_annotations(layer)?;
    let manifest = read_manifest(&blob, blob.size(), &annotations, opts)
        .context("Failed to read manifest")?;
    Ok((blob, manifest))
}

fn inspect(layer: &LayerArgs, format: OutputFormat) -> Result<()> {
    let (_, manifest) = open_layer(layer, &ManifestOptions::default())?;
    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string(&manifest.toc)?);
        return Ok(());
    }

    let mut rows: Vec<TocEntryRow> = Vec::new();
    for e in &manifest.toc.entries {
        if e.entry_type == EntryType::Chunk {
            if let Some(last) = rows.last_mut() {
                last.chunks += 1;
            }
            continue;
        }
        rows.push(TocEntryRow {
            entry_type: serde_json::to_value(e.entry_type)?
                .as_str()
                .unwrap_or_default()
                .to_string(),
            name: e.name.clone(),
            mode: format!("{:04o}", e.mode),
            uid: e.uid,
            gid: e.gid,
            size: e.size,
            chunks: usize::from(e.entry_type == EntryType::Reg && e.size > 0),
            digest: truncate_digest(&e.digest),
        });
    }
    output_slice(&rows, format).context("Failed to output TOC")?;
    Ok(())
}

fn footer(path: &Path, format: OutputFormat) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let f = read_footer(&file, file.metadata()?.len())?;
    let out = FooterOutput {
        manifest_type: f.manifest_type,
        manifest_offset: f.offset,
        manifest_compressed_size: f.length_compressed,
        manifest_uncompressed_size: f.length_uncompressed,
        tar_split_offset: f.offset_tar_split,
        tar_split_compressed_size: f.length_compressed_tar_split,
        tar_split_uncompressed_size: f.length_uncompressed_tar_split,
    };
    output_item(&out, format).context("Failed to output footer")?;
    Ok(())
}

fn convert(
    input: &Path,
    output: &Path,
    opts: &CompressorOptions,
    annotations_out: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    let reader: Box<dyn Read> = if input == Path::new("-") {
        Box::new(io::stdin().lock())
    } else {
        Box::new(
            File::open(input).with_context(|| format!("Failed to open {}", input.display()))?,
        )
    };
    let out = File::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let mut out = io::BufWriter::new(out);
    let layer = compress_tar(reader, &mut out, opts).context("Failed to convert tarball")?;
    out.into_inner()
        .map_err(|e| anyhow!("Failed to flush {}: {}", output.display(), e.error()))?
        .sync_all()?;

    if let Some(path) = annotations_out {
        let json = serde_json::to_vec_pretty(&layer.annotations)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    let out = ConvertOutput {
        toc_digest: layer.toc_digest.to_string(),
        diff_id: layer.diff_id.to_string(),
        uncompressed_size: layer.uncompressed_size,
        compressed_size: layer.compressed_size,
    };
    output_item(&out, format).context("Failed to output result")?;
    Ok(())
}

/// Build the layer cache from the configured repositories and `--reuse-from` trees.
fn layer_cache(config: &PullOptions, trees: &[PathBuf]) -> Result<LayerCache> {
    let mut cache = config.layer_cache();
    for (i, path) in trees.iter().enumerate() {
        let dir = Dir::open_ambient_dir(path, ambient_authority())
            .with_context(|| format!("Failed to open {}", path.display()))?;
        cache
            .add_tree(&format!("reuse-{i}"), dir)
            .with_context(|| format!("Failed to index {}", path.display()))?;
    }
    Ok(cache)
}

fn extract(
    layer: &LayerArgs,
    output: &Path,
    manifest_options: &ManifestOptions,
    opts: &ExtractionOptions,
    format: OutputFormat,
) -> Result<()> {
    let (blob, mut manifest) = open_layer(layer, manifest_options)?;

    std::fs::create_dir_all(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let root = Dir::open_ambient_dir(output, ambient_authority())
        .with_context(|| format!("Failed to open {}", output.display()))?;

    let res = apply_diff(&blob, &mut manifest, &root, opts).context("Failed to extract layer")?;
    let s = res.stats;
    let out = ExtractOutput {
        files_extracted: s.files_extracted,
        directories_created: s.directories_created,
        symlinks_created: s.symlinks_created,
        hardlinks_created: s.hardlinks_created,
        devices_created: s.devices_created,
        whiteouts_processed: s.whiteouts_processed,
        files_deduplicated: s.files_deduplicated,
        files_reused: s.files_reused,
        chunks_reused: s.chunks_reused,
        bytes_fetched: s.bytes_fetched,
        bytes_sparse: s.bytes_sparse,
        bytes_reflinked: s.bytes_reflinked,
        bytes_hardlinked: s.bytes_hardlinked,
        bytes_copied: s.bytes_copied,
        bytes_reused: s.bytes_reused,
        uncompressed_digest: res.uncompressed_digest.map(|d| d.to_string()),
        uncompressed_size: res.uncompressed_size,
    };
    output_item(&out, format).context("Failed to output stats")?;
    Ok(())
}

fn tar_size(path: &Path) -> Result<()> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut magic = [0u8; 4];
    let n = file.read(&mut magic)?;
    let file = File::open(path)?;
    let size = if n == magic.len() && magic == ZSTD_MAGIC {
        tar_size_from_tar_split(BufReader::new(zstd::stream::read::Decoder::new(file)?))?
    } else {
        tar_size_from_tar_split(BufReader::new(file))?
    };
    println!("{size}");
    Ok(())
}

fn dump(layer: &LayerArgs, verity_digests: Option<&Path>) -> Result<()> {
    let (_, manifest) = open_layer(layer, &ManifestOptions::default())?;
    let verity = match verity_digests {
        Some(path) => read_json_map(path)?,
        None => BTreeMap::new(),
    };
    let stdout = io::stdout().lock();
    generate_dump(&manifest.toc, &verity, stdout).context("Failed to write dump")?;
    io::stdout().flush()?;
    Ok(())
}
