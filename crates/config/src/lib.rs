//! Configuration for refindex.
//!
//! Values are layered, later sources overriding earlier ones:
//! 1. built-in defaults,
//! 2. a configuration file (TOML, YAML or JSON, picked by extension),
//! 3. `REFINDEX_*` environment variables, with `__` separating nested keys
//!    (`REFINDEX_SAVER__IDLE_MS=2000`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use refindex_store::{Mode, Options};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "REFINDEX_";
const FILE_NAME: &str = "refindex.toml";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "refindex")
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Where the index's database files live.
    pub directory: PathBuf,
    pub mode: Mode,
    /// Names of the association relations to open.
    pub associations: Vec<String>,
    pub store: Options,
    pub saver: SaverConfig,
}

impl Default for Config {
    fn default() -> Self {
        let directory = project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("refindex-data"));
        Self {
            directory,
            mode: Mode::default(),
            associations: Vec::new(),
            store: Options::default(),
            saver: SaverConfig::default(),
        }
    }
}

/// When the background saver flushes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SaverConfig {
    /// How often the saver wakes up to look for work.
    pub tick_ms: u64,
    /// Save once nothing has been written for this long.
    pub idle_ms: u64,
    /// Save regardless of activity once any table has this many uncommitted
    /// rows (or the hash table this many dirty shard rows).
    pub pending_threshold: u64,
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self { tick_ms: 1_000, idle_ms: 5_000, pending_threshold: 100_000 }
    }
}

impl SaverConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

impl Config {
    /// The configuration file used when none is given explicitly.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(FILE_NAME))
    }

    /// Load and validate the configuration.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// used if a file is present there.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Self::default()));
        let figment = match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Some(path) => Self::merge_file(figment, path)?,
            None => match Self::default_path().filter(|path| path.is_file()) {
                Some(path) => Self::merge_file(figment, &path)?,
                None => figment,
            },
        };
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
        tracing::debug!(path = %path.display(), "Loading configuration file");
        let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
        Ok(match extension.as_deref() {
            Some("toml") => figment.merge(Toml::file(path)),
            Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
            Some("json") => figment.merge(Json::file(path)),
            _ => exn::bail!(ErrorKind::Invalid(format!("unsupported configuration format: {}", path.display()))),
        })
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("saver.tick_ms", self.saver.tick_ms),
            ("saver.idle_ms", self.saver.idle_ms),
            ("saver.pending_threshold", self.saver.pending_threshold),
            ("store.read_connections", u64::from(self.store.read_connections)),
        ];
        if let Some((key, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            exn::bail!(ErrorKind::Invalid(format!("{key} must be greater than zero")));
        }
        let mut seen = HashSet::new();
        for name in &self.associations {
            let valid = !name.is_empty()
                && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
            if !valid {
                exn::bail!(ErrorKind::Invalid(format!("association name {name:?} must match [a-z0-9_]+")));
            }
            if !seen.insert(name.as_str()) {
                exn::bail!(ErrorKind::Invalid(format!("association {name:?} is listed twice")));
            }
        }
        Ok(())
    }
}
