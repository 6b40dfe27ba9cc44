//! Pull options from container storage configuration.
//!
//! Partial pulls are configured in the `pull_options` table of a
//! containers-storage `storage.conf`:
//!
//! ```toml
//! [storage]
//! driver = "overlay"
//!
//! [storage.options]
//! ignore_chown_errors = "true"
//!
//! [storage.options.pull_options]
//! enable_partial_images = "true"
//! use_hard_links = "false"
//! convert_images = "false"
//! ostree_repos = "/ostree/repo:/sysroot/ostree/repo"
//! ```
//!
//! Values in `pull_options` are strings by convention, so booleans are
//! accepted both quoted and bare. Unknown keys are ignored.
//!
//! # Usage Example
//!
//! ```no_run
//! use cstor_chunked::config::PullOptions;
//!
//! # fn example() -> cstor_chunked::Result<()> {
//! let opts = PullOptions::load()?;
//! if opts.enable_partial_images {
//!     let extraction = opts.extraction_options();
//!     println!("hard links: {}", extraction.use_hard_links);
//! }
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use serde::{Deserialize, Deserializer};

use crate::cache::LayerCache;
use crate::error::{ChunkedError, Result};
use crate::extract::ExtractionOptions;
use crate::manifest::{DEFAULT_MAX_TOC_SIZE, ManifestOptions};

/// System-wide configuration file.
pub const SYSTEM_STORAGE_CONF: &str = "/etc/containers/storage.conf";

/// Environment variable naming a configuration file that replaces the
/// default search.
pub const STORAGE_CONF_ENV: &str = "CONTAINERS_STORAGE_CONF";

/// Effective pull options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullOptions {
    /// Use partial pulls when the layer supports them.
    pub enable_partial_images: bool,
    /// Hard link files with identical content and metadata.
    pub use_hard_links: bool,
    /// Ignore chown failures during extraction.
    pub ignore_chown_errors: bool,
    /// Convert layers without a TOC after a full download.
    pub convert_images: bool,
    /// Skip computing the uncompressed digest of partially pulled layers.
    pub insecure_allow_unpredictable_image_contents: bool,
    /// Upper bound for the TOC and tar-split sizes.
    pub max_toc_size: u64,
    /// OSTree repositories to reuse file content from.
    pub ostree_repos: Vec<PathBuf>,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            enable_partial_images: true,
            use_hard_links: false,
            ignore_chown_errors: false,
            convert_images: false,
            insecure_allow_unpredictable_image_contents: false,
            max_toc_size: DEFAULT_MAX_TOC_SIZE,
            ostree_repos: Vec::new(),
        }
    }
}

/// A boolean written either as `true` or as `"true"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum LenientBool {
    Bool(bool),
    Str(String),
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<bool>, D::Error> {
    let v: Option<LenientBool> = Option::deserialize(d)?;
    v.map(|v| match v {
        LenientBool::Bool(b) => Ok(b),
        LenientBool::Str(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            _ => Err(serde::de::Error::custom(format!("invalid boolean {s:?}"))),
        },
    })
    .transpose()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LenientU64 {
    Int(u64),
    Str(String),
}

fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
    let v: Option<LenientU64> = Option::deserialize(d)?;
    v.map(|v| match v {
        LenientU64::Int(n) => Ok(n),
        LenientU64::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid size {s:?}"))),
    })
    .transpose()
}

/// The parts of a `storage.conf` this crate reads. Every field is optional
/// so several files can be layered.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    storage: StorageTable,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StorageTable {
    #[serde(default)]
    options: OptionsTable,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OptionsTable {
    #[serde(default, deserialize_with = "lenient_bool")]
    ignore_chown_errors: Option<bool>,
    #[serde(default)]
    pull_options: PullOptionsTable,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PullOptionsTable {
    #[serde(default, deserialize_with = "lenient_bool")]
    enable_partial_images: Option<bool>,
    #[serde(default, deserialize_with = "lenient_bool")]
    use_hard_links: Option<bool>,
    #[serde(default, deserialize_with = "lenient_bool")]
    convert_images: Option<bool>,
    #[serde(default, deserialize_with = "lenient_bool")]
    insecure_allow_unpredictable_image_contents: Option<bool>,
    #[serde(default, deserialize_with = "lenient_u64")]
    max_toc_size: Option<u64>,
    /// Colon-separated paths.
    #[serde(default)]
    ostree_repos: Option<String>,
}

impl StorageConfig {
    /// Parse storage configuration from TOML content.
    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Read and parse a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| ChunkedError::Format(format!("parsing {}: {e}", path.display())))
    }

    /// Override `opts` with every value set in this file.
    pub fn apply_to(&self, opts: &mut PullOptions) {
        let o = &self.storage.options;
        let p = &o.pull_options;
        let set = |dst: &mut bool, v: Option<bool>| {
            if let Some(v) = v {
                *dst = v;
            }
        };
        set(&mut opts.ignore_chown_errors, o.ignore_chown_errors);
        set(&mut opts.enable_partial_images, p.enable_partial_images);
        set(&mut opts.use_hard_links, p.use_hard_links);
        set(&mut opts.convert_images, p.convert_images);
        set(
            &mut opts.insecure_allow_unpredictable_image_contents,
            p.insecure_allow_unpredictable_image_contents,
        );
        if let Some(n) = p.max_toc_size {
            opts.max_toc_size = n;
        }
        if let Some(repos) = &p.ostree_repos {
            opts.ostree_repos = repos
                .split(':')
                .filter(|r| !r.is_empty())
                .map(PathBuf::from)
                .collect();
        }
    }
}

/// Per-user configuration file, if a home directory is known.
fn user_storage_conf() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg).join("containers/storage.conf"));
    }
    std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .map(|home| PathBuf::from(home).join(".config/containers/storage.conf"))
}

impl PullOptions {
    /// Files consulted by [`PullOptions::load`], lowest priority first.
    pub fn search_paths() -> Vec<PathBuf> {
        if let Some(path) = std::env::var_os(STORAGE_CONF_ENV).filter(|v| !v.is_empty()) {
            return vec![PathBuf::from(path)];
        }
        let mut paths = vec![PathBuf::from(SYSTEM_STORAGE_CONF)];
        paths.extend(user_storage_conf());
        paths
    }

    /// Load the defaults overridden by every existing configuration file.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::search_paths())
    }

    /// Load the defaults overridden by every file of `paths` that exists,
    /// later files taking precedence.
    pub fn load_from(paths: &[PathBuf]) -> Result<Self> {
        let mut opts = Self::default();
        for path in paths {
            if !path.exists() {
                continue;
            }
            tracing::debug!("reading pull options from {}", path.display());
            StorageConfig::from_file(path)?.apply_to(&mut opts);
        }
        Ok(opts)
    }

    /// Manifest reading options honoring `max_toc_size`.
    pub fn manifest_options(&self) -> ManifestOptions {
        ManifestOptions {
            max_toc_size: self.max_toc_size,
            ..Default::default()
        }
    }

    /// A layer cache holding the configured OSTree repositories.
    ///
    /// Repositories that cannot be opened are skipped with a warning.
    pub fn layer_cache(&self) -> LayerCache {
        let mut cache = LayerCache::new();
        for repo in &self.ostree_repos {
            match Dir::open_ambient_dir(repo, ambient_authority()) {
                Ok(dir) => cache.add_ostree_repo(dir),
                Err(e) => tracing::warn!("skipping OSTree repository {}: {e}", repo.display()),
            }
        }
        cache
    }

    /// Extraction options for these pull options.
    pub fn extraction_options(&self) -> ExtractionOptions {
        ExtractionOptions {
            use_hard_links: self.use_hard_links,
            ignore_chown_errors: self.ignore_chown_errors,
            insecure_allow_unpredictable_image_contents: self
                .insecure_allow_unpredictable_image_contents,
            ..Default::default()
        }
    }
}
