//! A [`BlockSink`] writing every block to its own JSON lines file.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use blockpipe_clap_blocks::storage::{StorageConfig, StorageLevel};
use blockpipe_id::BlockId;
use blockpipe_pipeline::{BlockSink, DynError};
use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Writes blocks to `<output-dir>/<run-id>/block-<block-id>.jsonl`.
///
/// Block ids restart with every process, so each run writes into its own directory. A block is
/// written to a temporary file which is renamed into place once complete, so a block file is
/// either missing or holds the whole block.
///
/// With [`StorageLevel::Memory`] blocks are only counted and then dropped.
#[derive(Debug)]
pub(crate) struct DirectorySink {
    dir: PathBuf,
    storage_level: StorageLevel,
    discarded: Mutex<Discarded>,
}

/// What the `memory` storage level accepted so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Discarded {
    blocks: u64,
    units: u64,
}

impl DirectorySink {
    pub(crate) async fn new(config: &StorageConfig) -> anyhow::Result<Self> {
        let run_id = Uuid::now_v7();
        let dir = config.output_dir.join(run_id.to_string());
        if config.storage_level != StorageLevel::Memory {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating output directory {}", dir.display()))?;
        }
        info!(
            dir = %dir.display(),
            storage_level = %config.storage_level,
            "directory sink ready"
        );

        Ok(Self {
            dir,
            storage_level: config.storage_level,
            discarded: Default::default(),
        })
    }

    #[cfg(test)]
    fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    #[cfg(test)]
    fn discarded(&self) -> Discarded {
        *self.discarded.lock()
    }

    fn block_path(&self, block_id: BlockId) -> PathBuf {
        self.dir.join(format!("block-{block_id}.jsonl"))
    }

    async fn write_file(&self, block_id: BlockId, units: &[Value]) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        for unit in units {
            serde_json::to_writer(&mut buf, unit)?;
            buf.push(b'\n');
        }

        let path = self.block_path(block_id);
        let tmp = path.with_extension("jsonl.tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(&buf)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        file.flush().await?;
        if self.storage_level == StorageLevel::DiskSync {
            file.sync_all()
                .await
                .with_context(|| format!("syncing {}", tmp.display()))?;
        }
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        debug!(%block_id, path = %path.display(), bytes = buf.len(), "block written");
        Ok(())
    }
}

#[async_trait]
impl BlockSink<Value> for DirectorySink {
    async fn store(&self, block_id: BlockId, units: &[Value]) -> Result<(), DynError> {
        match self.storage_level {
            StorageLevel::Memory => {
                let mut discarded = self.discarded.lock();
                discarded.blocks += 1;
                discarded.units += units.len() as u64;
                debug!(
                    %block_id,
                    n_units = units.len(),
                    total_blocks = discarded.blocks,
                    "block accepted in memory and dropped"
                );
                Ok(())
            }
            StorageLevel::Disk | StorageLevel::DiskSync => {
                Ok(self.write_file(block_id, units).await?)
            }
        }
    }
}
