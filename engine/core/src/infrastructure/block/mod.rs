// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Block Image Infrastructure Module
//!
//! Concrete implementations of the BlockImageProvider trait.

pub mod lvm;
pub mod memory;

pub use lvm::LvmBlockProvider;
pub use memory::InMemoryBlockProvider;

use std::path::PathBuf;
use std::sync::Arc;

use crate::domain::image::BlockImageProvider;
use crate::infrastructure::command::CommandRunner;
use crate::infrastructure::procfs::ProcFs;

/// Block backend configuration
#[derive(Debug, Clone)]
pub enum BlockBackend {
    /// Loop device + LVM volume group (production, needs root)
    Lvm { proc_root: PathBuf },

    /// Directory-backed fake for development and testing
    InMemory { root: PathBuf },
}

/// Factory function to create a block image provider from configuration
pub fn create_block_provider(
    backend: BlockBackend,
    runner: Arc<dyn CommandRunner>,
) -> Arc<dyn BlockImageProvider> {
    match backend {
        BlockBackend::Lvm { proc_root } => {
            Arc::new(LvmBlockProvider::new(runner, ProcFs::new(proc_root)))
        }
        BlockBackend::InMemory { root } => Arc::new(InMemoryBlockProvider::new(root)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::command::ScriptedCommandRunner;

    #[tokio::test]
    async fn test_factory_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let provider = create_block_provider(
            BlockBackend::InMemory {
                root: dir.path().to_path_buf(),
            },
            Arc::new(ScriptedCommandRunner::new()),
        );
        assert!(provider.list_images().await.unwrap().images.is_empty());
    }
}
