//! Config for the block output directory.

use std::path::PathBuf;

/// How durably a written block must be stored before it counts as persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StorageLevel {
    /// Accept blocks without storing them anywhere. Their records are still acknowledged, so
    /// this is only meant for dry runs.
    Memory,

    /// Write each block to a file and flush it.
    #[default]
    Disk,

    /// Write each block to a file and wait for the OS to sync it to the device.
    DiskSync,
}

impl std::fmt::Display for StorageLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Disk => f.write_str("disk"),
            Self::DiskSync => f.write_str("disk-sync"),
        }
    }
}

/// CLI config for the block sink.
#[derive(Debug, Clone, clap::Parser)]
pub struct StorageConfig {
    /// Directory that sealed blocks are written to.
    #[clap(long = "output-dir", env = "BLOCKPIPE_OUTPUT_DIR", action)]
    pub output_dir: PathBuf,

    /// Storage durability level for written blocks.
    #[clap(
        long = "storage-level",
        env = "BLOCKPIPE_STORAGE_LEVEL",
        default_value_t = StorageLevel::default(),
        value_enum,
        action
    )]
    pub storage_level: StorageLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;

    #[test]
    fn test_storage_level() {
        let config = StorageConfig::parse_from(["blockpipe", "--output-dir", "/tmp/blocks"]);
        assert_eq!(config.storage_level, StorageLevel::Disk);

        let config = StorageConfig::parse_from([
            "blockpipe",
            "--output-dir",
            "/tmp/blocks",
            "--storage-level",
            "disk-sync",
        ]);
        assert_eq!(config.storage_level, StorageLevel::DiskSync);
        assert_eq!(config.storage_level.to_string(), "disk-sync");
    }
}
