// src/block_source.rs - Where raw blocks come from

use crate::block::RawBlock;
use log::debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockSourceError {
    #[error("Block {0} is not available yet")]
    NotAvailable(u32),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed block file: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait BlockSource {
    fn get_block(&mut self, height: u32) -> Result<RawBlock, BlockSourceError>;
}

/// Reads `<dir>/<height>.json` files, one raw block per file.
#[derive(Debug, Clone)]
pub struct DirectoryBlockSource {
    dir: PathBuf,
}

impl DirectoryBlockSource {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, height: u32) -> PathBuf {
        self.dir.join(format!("{}.json", height))
    }
}

impl BlockSource for DirectoryBlockSource {
    fn get_block(&mut self, height: u32) -> Result<RawBlock, BlockSourceError> {
        let path = self.path_for(height);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(BlockSourceError::NotAvailable(height)),
            Err(e) => return Err(e.into()),
        };
        let block: RawBlock = serde_json::from_slice(&bytes)?;
        debug!("[SOURCE] Read block {} from {}.", height, path.display());
        Ok(block)
    }
}

/// Blocks held in memory, used when replaying a prepared chain.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockSource {
    blocks: Vec<RawBlock>,
}

impl MemoryBlockSource {
    pub fn new(blocks: Vec<RawBlock>) -> Self {
        Self { blocks }
    }

    pub fn push(&mut self, block: RawBlock) {
        self.blocks.retain(|b| b.height != block.height);
        self.blocks.push(block);
    }
}

impl BlockSource for MemoryBlockSource {
    fn get_block(&mut self, height: u32) -> Result<RawBlock, BlockSourceError> {
        self.blocks
            .iter()
            .find(|b| b.height == height)
            .cloned()
            .ok_or(BlockSourceError::NotAvailable(height))
    }
}
