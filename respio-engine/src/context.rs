//! # Engine Context
//!
//! Purpose: Bundle the shared pools and worker runtime that every connection
//! built from one configuration draws on.
//!
//! ## Design Principles
//! 1. **Cheap Clones**: The context is an `Arc` handle; connections clone it.
//! 2. **Validate Once**: Configuration is checked here, not on the hot path.

use std::io;
use std::sync::Arc;

use respio_common::EngineConfig;

use crate::block::{BlockBuffer, BlockBufferPool};
use crate::message::MessagePool;
use crate::page::PagePool;
use crate::read_buffer::SegmentedReadBuffer;
use crate::scanner::FrameScanner;
use crate::workers::ParseWorkers;

struct ContextInner {
    config: EngineConfig,
    pages: PagePool,
    blocks: BlockBufferPool,
    workers: Option<ParseWorkers>,
}

/// Shared pools and workers for a family of connections.
#[derive(Clone)]
pub struct EngineContext {
    inner: Arc<ContextInner>,
}

impl EngineContext {
    /// Builds the pools described by `config`.
    pub fn new(config: EngineConfig) -> io::Result<Self> {
        config
            .validate()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let workers = match config.parse_workers {
            0 => None,
            threads => Some(ParseWorkers::new(threads)?),
        };
        Ok(EngineContext {
            inner: Arc::new(ContextInner {
                pages: PagePool::new(config.page_size, config.page_pool_capacity),
                blocks: BlockBufferPool::new(&config),
                workers,
                config,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn pages(&self) -> &PagePool {
        &self.inner.pages
    }

    pub fn blocks(&self) -> &BlockBufferPool {
        &self.inner.blocks
    }

    /// Parse workers, when configured.
    pub fn workers(&self) -> Option<&ParseWorkers> {
        self.inner.workers.as_ref()
    }

    /// A fresh read buffer drawing on the shared page pool.
    pub fn read_buffer(&self) -> SegmentedReadBuffer {
        SegmentedReadBuffer::new(self.inner.pages.clone(), self.inner.config.segment_free_list_depth)
    }

    /// A fresh outbound buffer.
    pub fn block_buffer(&self) -> BlockBuffer {
        self.inner.blocks.acquire(0)
    }

    pub fn scanner(&self, pubsub: bool) -> FrameScanner {
        FrameScanner::new(self.inner.config.max_streaming_depth, pubsub)
    }

    /// A per-connection message free list.
    pub fn message_pool(&self) -> MessagePool {
        MessagePool::new(self.inner.config.message_pool_capacity)
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        let config = EngineConfig::default();
        EngineContext {
            inner: Arc::new(ContextInner {
                pages: PagePool::new(config.page_size, config.page_pool_capacity),
                blocks: BlockBufferPool::new(&config),
                workers: None,
                config,
            }),
        }
    }
}
