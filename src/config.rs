//! Registry configuration, read from a JSON file.

use crate::Error;
use std::path::{Path, PathBuf};

fn default_threads() -> usize {
    4
}

fn default_cache() -> CacheConfig {
    CacheConfig::default()
}

fn default_cache_megabytes() -> u64 {
    128
}

/// Per-table cache budgets, in megabytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_megabytes")]
    pub sequence: u64,
    #[serde(default = "default_cache_megabytes")]
    pub genomic: u64,
    #[serde(default = "default_cache_megabytes")]
    pub protein: u64,
    #[serde(default = "default_cache_megabytes")]
    pub id_ca: u64,
    #[serde(default = "default_cache_megabytes")]
    pub id_pa: u64,
    #[serde(default = "default_cache_megabytes")]
    pub id_short: u64,
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig {
            sequence: default_cache_megabytes(),
            genomic: default_cache_megabytes(),
            protein: default_cache_megabytes(),
            id_ca: default_cache_megabytes(),
            id_pa: default_cache_megabytes(),
            id_short: default_cache_megabytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding every table and index file pair.
    pub database_path: PathBuf,
    #[serde(default = "default_threads")]
    pub cpu_threads: usize,
    #[serde(default = "default_threads")]
    pub io_threads: usize,
    #[serde(default = "default_cache")]
    pub cache_megabytes: CacheConfig,
    /// Lengths of the main-genome references, in order; the prefix sums map
    /// (reference, offset) coordinates onto the linear 32-bit key space.
    #[serde(default)]
    pub reference_lengths: Vec<u32>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config, Error> {
        let raw = std::fs::read(path)
            .map_err(|e| Error::from(e).with_context(format!("reading {}", path.display())))?;
        serde_json::from_slice(&raw).map_err(|e| Error::BadConfig(e.to_string()))
    }

    /// A small single-machine default for tests and the driver binary.
    pub fn default_for(database_path: &Path) -> Config {
        Config {
            database_path: database_path.to_path_buf(),
            cpu_threads: default_threads(),
            io_threads: default_threads(),
            cache_megabytes: CacheConfig::default(),
            reference_lengths: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn parses_a_minimal_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("conf.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"database_path": "/var/lib/alleles", "reference_lengths": [1000, 2000]}}"#
        )
        .unwrap();
        drop(f);
        let conf = Config::from_file(&path).unwrap();
        assert_eq!(conf.database_path, PathBuf::from("/var/lib/alleles"));
        assert_eq!(conf.cpu_threads, 4);
        assert_eq!(conf.cache_megabytes.genomic, 128);
        assert_eq!(conf.reference_lengths, vec![1000, 2000]);
    }

    #[test]
    fn rejects_malformed_json() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("conf.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(Config::from_file(&path), Err(Error::BadConfig(_))));
    }
}
