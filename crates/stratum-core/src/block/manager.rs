//! Facade over one host allocator and N device allocators (spec.md §4.2).

use std::sync::Arc;

use tracing::debug;

use crate::block::allocator::{AllocatorConfig, BlockAllocator, BlockOwner};
use crate::block::backend::DeviceBackend;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::types::{BlockId, Rank};

/// Result of `CalculateBlockNumber`'s capacity sizing pass.
#[derive(Debug, Clone, Copy)]
pub struct CapacitySizing {
    pub device_blocks_num: usize,
    pub host_block_num: usize,
}

/// Composes one host allocator and one device allocator per tensor-parallel
/// rank, grounded on the teacher's `KVCacheManager` facade generalized to a
/// multi-device pool.
pub struct BlockManager {
    config: EngineConfig,
    backend: Arc<dyn DeviceBackend>,
    device_allocators: Vec<BlockAllocator>,
    host_allocator: BlockAllocator,
}

impl BlockManager {
    pub fn new(config: EngineConfig, backend: Arc<dyn DeviceBackend>) -> Self {
        let device_allocators = (0..config.tensor_para_size)
            .map(|r| {
                BlockAllocator::new(AllocatorConfig {
                    block_size: config.block_size,
                    blocks_num: config.blocks_num,
                    block_token_num: config.block_token_num,
                    owner: BlockOwner::Device(r),
                })
            })
            .collect();
        let host_allocator = BlockAllocator::new(AllocatorConfig {
            block_size: config.block_size,
            blocks_num: (config.blocks_num as f64 * config.block_host_memory_factor) as usize,
            block_token_num: config.block_token_num,
            owner: BlockOwner::Host,
        });

        Self {
            config,
            backend,
            device_allocators,
            host_allocator,
        }
    }

    pub fn device(&self, rank: Rank) -> Result<&BlockAllocator> {
        self.device_allocators
            .get(rank.0)
            .ok_or_else(|| Error::InvalidArgument(format!("no such rank {rank}")))
    }

    pub fn host(&self) -> &BlockAllocator {
        &self.host_allocator
    }

    pub fn set_device_id(&self, rank: Rank) -> Result<()> {
        self.backend.set_device_id(rank)
    }

    /// Derives device and host block pool sizes from live free memory
    /// (spec.md §4.2). `rank` selects which device's memory info is queried;
    /// all ranks are expected to be symmetric.
    pub fn calculate_block_number(&self, rank: Rank) -> Result<CapacitySizing> {
        self.set_device_id(rank)?;
        let (device_total, device_free) = self.backend.device_memory_info(rank)?;
        let reserved = (device_total as f64 * self.config.reserved_device_memory_ratio) as u64;

        let usable_bytes = if self.config.block_device_memory_ratio >= 0.0 {
            (device_total as f64 * self.config.block_device_memory_ratio) as u64
        } else {
            device_free.saturating_sub(reserved)
        };
        let device_blocks_num = (usable_bytes / self.config.block_size as u64) as usize;
        let host_block_num =
            (device_blocks_num as f64 * self.config.block_host_memory_factor) as usize;

        let host_required = host_block_num as u64 * self.config.block_size as u64;
        let host_free = self.backend.host_memory_free()?;
        if host_required > host_free {
            return Err(Error::InsufficientHostMemory {
                needed: host_required,
                available: host_free,
            });
        }

        debug!(device_blocks_num, host_block_num, "calculate_block_number");
        Ok(CapacitySizing {
            device_blocks_num,
            host_block_num,
        })
    }

    /// Allocate host blocks, copy device blocks out, then free the device
    /// blocks. Copies are synchronous in this backend, so the free below is
    /// always ordered after copy completion (spec.md's free-after-copy
    /// resolution). Fails with `Unimplemented` if `ctx` is running
    /// CONTEXT/DECODE concurrently, per spec.md §4.2.
    pub fn swap_out(&self, ctx: &Context, rank: Rank, device_ids: &[BlockId]) -> Result<Vec<BlockId>> {
        ctx.require_serial()?;
        self.set_device_id(rank)?;
        let host_ids = self.host_allocator.allocate_blocks(device_ids.len())?;
        let device_addrs = self.device(rank)?.get_block_ptrs(device_ids)?;
        let host_addrs = self.host_allocator.get_block_ptrs(&host_ids)?;
        self.backend.copy_device_to_host(
            rank,
            &device_addrs,
            &host_addrs,
            self.config.block_size,
        )?;
        self.device(rank)?.free_blocks(device_ids)?;
        Ok(host_ids)
    }

    /// Mirror of `swap_out`: host blocks are freed after the copies complete.
    pub fn swap_in(&self, ctx: &Context, rank: Rank, host_ids: &[BlockId]) -> Result<Vec<BlockId>> {
        ctx.require_serial()?;
        self.set_device_id(rank)?;
        let device_ids = self.device(rank)?.allocate_blocks(host_ids.len())?;
        let host_addrs = self.host_allocator.get_block_ptrs(host_ids)?;
        let device_addrs = self.device(rank)?.get_block_ptrs(&device_ids)?;
        self.backend.copy_host_to_device(
            rank,
            &host_addrs,
            &device_addrs,
            self.config.block_size,
        )?;
        self.host_allocator.free_blocks(host_ids)?;
        Ok(device_ids)
    }

    /// Free host blocks without copying; used for aborted requests.
    pub fn swap_drop(&self, host_ids: &[BlockId]) -> Result<()> {
        self.host_allocator.free_blocks(host_ids)
    }

    pub fn stats(&self) -> BlockManagerStats {
        BlockManagerStats {
            device_free: self
                .device_allocators
                .iter()
                .map(|a| a.get_free_block_number())
                .collect(),
            device_used: self
                .device_allocators
                .iter()
                .map(|a| a.get_used_block_number())
                .collect(),
            host_free: self.host_allocator.get_free_block_number(),
            host_used: self.host_allocator.get_used_block_number(),
        }
    }
}

/// Snapshot of pool occupancy, surfaced on the metrics endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BlockManagerStats {
    pub device_free: Vec<usize>,
    pub device_used: Vec<usize>,
    pub host_free: usize,
    pub host_used: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::backend::SimulatedDeviceBackend;

    fn manager(tensor_para_size: usize) -> BlockManager {
        let config = EngineConfig {
            tensor_para_size,
            blocks_num: 8,
            block_size: 64,
            block_token_num: 4,
            block_host_memory_factor: 2.0,
            ..EngineConfig::default()
        };
        let backend = Arc::new(SimulatedDeviceBackend::new(
            tensor_para_size,
            1 << 20,
            1 << 20,
            1 << 20,
        ));
        BlockManager::new(config, backend)
    }

    #[test]
    fn swap_out_then_in_preserves_bytes() {
        let m = manager(1);
        let ctx = Context::new(1);
        let device_ids = m.device(Rank(0)).unwrap().allocate_blocks(2).unwrap();
        let host_ids = m.swap_out(&ctx, Rank(0), &device_ids).unwrap();
        assert_eq!(host_ids.len(), 2);
        assert_eq!(m.device(Rank(0)).unwrap().get_used_block_number(), 0);
        assert_eq!(m.host().get_used_block_number(), 2);

        let back = m.swap_in(&ctx, Rank(0), &host_ids).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(m.host().get_used_block_number(), 0);
        assert_eq!(m.device(Rank(0)).unwrap().get_used_block_number(), 2);
    }

    #[test]
    fn swap_drop_frees_host_blocks_without_copy() {
        let m = manager(1);
        let ctx = Context::new(1);
        let device_ids = m.device(Rank(0)).unwrap().allocate_blocks(1).unwrap();
        let host_ids = m.swap_out(&ctx, Rank(0), &device_ids).unwrap();
        m.swap_drop(&host_ids).unwrap();
        assert_eq!(m.host().get_used_block_number(), 0);
    }

    #[test]
    fn calculate_block_number_respects_reserve_ratio() {
        let m = manager(1);
        let sizing = m.calculate_block_number(Rank(0)).unwrap();
        assert!(sizing.device_blocks_num > 0);
        assert!(sizing.host_block_num > sizing.device_blocks_num);
    }
}
