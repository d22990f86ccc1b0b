//! Fixed-size block pool allocator (spec.md §4.1).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};
use crate::types::BlockId;

/// Which memory pool a block lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOwner {
    Host,
    Device(usize),
}

/// `{block_size, blocks_num, block_token_num, device | host}` (spec.md §3).
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub block_size: usize,
    pub blocks_num: usize,
    pub block_token_num: usize,
    pub owner: BlockOwner,
}

/// A single fixed-size memory block. Invariant: a block is in exactly one of
/// {free-pool, used-map, contiguous-used-map} at any time — enforced by
/// `BlockAllocator` never duplicating a `BlockId` across its maps.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub owner: BlockOwner,
    pub size: usize,
    pub ref_count: usize,
    pub address: usize,
}

struct Inner {
    blocks: Vec<Block>,
    free_map: HashSet<BlockId>,
    free_order: VecDeque<BlockId>,
    used_map: HashMap<BlockId, usize>,
}

struct ContiguousInner {
    next_address: usize,
    used_contiguous_memory_map: HashMap<BlockId, (usize, usize)>,
    next_id: usize,
}

/// Block pool for a single device (or host) allocator.
///
/// Block operations and contiguous operations are guarded by separate
/// mutexes so the two never contend (spec.md §4.1).
pub struct BlockAllocator {
    config: AllocatorConfig,
    inner: Mutex<Inner>,
    contiguous: Mutex<ContiguousInner>,
}

impl BlockAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        let blocks: Vec<Block> = (0..config.blocks_num)
            .map(|i| Block {
                id: BlockId(i),
                owner: config.owner,
                size: config.block_size,
                ref_count: 0,
                address: i * config.block_size,
            })
            .collect();
        let free_order: VecDeque<BlockId> = blocks.iter().map(|b| b.id).collect();
        let free_map: HashSet<BlockId> = free_order.iter().copied().collect();
        let base_contiguous_address = config.blocks_num * config.block_size;

        Self {
            config,
            inner: Mutex::new(Inner {
                blocks,
                free_map,
                free_order,
                used_map: HashMap::new(),
            }),
            contiguous: Mutex::new(ContiguousInner {
                next_address: base_contiguous_address,
                used_contiguous_memory_map: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Grow or shrink the free pool to exactly `n` blocks not currently
    /// handed out. Blocks in `used_map` always stay live; when `n` is less
    /// than what's already live, the shrink target applies only to the free
    /// pool (`target_free = n.saturating_sub(used_map.len())`).
    pub fn reset_pre_allocated_blocks(&self, n: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let used = inner.used_map.len();
        let target_free = n.saturating_sub(used);
        let current_free = inner.free_order.len();

        if target_free > current_free {
            let grow_by = target_free - current_free;
            let mut next_id = inner.blocks.len();
            for _ in 0..grow_by {
                let id = BlockId(next_id);
                next_id += 1;
                inner.blocks.push(Block {
                    id,
                    owner: self.config.owner,
                    size: self.config.block_size,
                    ref_count: 0,
                    address: id.0 * self.config.block_size,
                });
                inner.free_map.insert(id);
                inner.free_order.push_back(id);
            }
        } else if target_free < current_free {
            let shrink_by = current_free - target_free;
            for _ in 0..shrink_by {
                if let Some(id) = inner.free_order.pop_back() {
                    inner.free_map.remove(&id);
                }
            }
        }
        debug!(target_free, used, "reset_pre_allocated_blocks");
        Ok(())
    }

    /// Pop `n` ids from the free pool into the used map, all-or-nothing.
    pub fn allocate_blocks(&self, n: usize) -> Result<Vec<BlockId>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.free_order.len() < n {
            return Err(Error::OutOfDeviceMemory {
                requested: n,
                free: inner.free_order.len(),
            });
        }
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let id = inner.free_order.pop_front().expect("checked length above");
            inner.free_map.remove(&id);
            inner.used_map.insert(id, 1);
            out.push(id);
        }
        Ok(out)
    }

    /// Decrement ref counts; blocks reaching zero return to the free pool.
    pub fn free_blocks(&self, ids: &[BlockId]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for &id in ids {
            let ref_count = inner
                .used_map
                .get_mut(&id)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown block id {id}")))?;
            *ref_count -= 1;
            if *ref_count == 0 {
                inner.used_map.remove(&id);
                inner.free_map.insert(id);
                inner.free_order.push_back(id);
            }
        }
        Ok(())
    }

    /// Allocate a bespoke region outside the block pool, for scratch tensors.
    pub fn allocate_contiguous(&self, bytes: usize) -> Result<BlockId> {
        let mut c = self.contiguous.lock().unwrap();
        let id = BlockId(usize::MAX - c.next_id);
        c.next_id += 1;
        let address = c.next_address;
        c.next_address += bytes;
        c.used_contiguous_memory_map.insert(id, (address, bytes));
        Ok(id)
    }

    pub fn free_contiguous(&self, id: BlockId) -> Result<()> {
        let mut c = self.contiguous.lock().unwrap();
        c.used_contiguous_memory_map
            .remove(&id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown contiguous block {id}")))?;
        Ok(())
    }

    /// Pointer lookup; succeeds iff every id is currently in `used_map` or
    /// `free_map` (both are tracked, per spec.md §4.1).
    pub fn get_block_ptrs(&self, ids: &[BlockId]) -> Result<Vec<usize>> {
        let inner = self.inner.lock().unwrap();
        ids.iter()
            .map(|id| {
                inner
                    .blocks
                    .get(id.0)
                    .map(|b| b.address)
                    .filter(|_| inner.used_map.contains_key(id) || inner.free_map.contains(id))
                    .ok_or_else(|| Error::InvalidArgument(format!("unknown block id {id}")))
            })
            .collect()
    }

    pub fn get_free_block_number(&self) -> usize {
        self.inner.lock().unwrap().free_order.len()
    }

    pub fn get_used_block_number(&self) -> usize {
        self.inner.lock().unwrap().used_map.len()
    }
}
