use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use {
    parking_lot::Mutex,
    slab::Slab,
    subheap_core::{Device, Fence, HeapProperties, HeapType, ResourceFlags, ResourceState},
};

use crate::{
    allocator::BackingBuffer,
    location::ResourceLocation,
    util::ceil_log2,
    utilization::{AllocatorStats, Kind},
};

/// Config for `BucketAllocator`.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BucketConfig {
    /// Memory pool of the backing buffers.
    pub heap_type: HeapType,

    /// Flags of the backing buffers.
    pub resource_flags: ResourceFlags,

    /// State of the backing buffers.
    pub initial_state: ResourceState,

    /// Nodes that can see the memory.
    pub visibility_mask: u32,

    /// Minimal size of a backing buffer.
    pub min_heap_size: u64,

    /// Bucket `0` holds blocks of `1 << bucket_shift` bytes.
    pub bucket_shift: u32,

    /// Number of buckets. Each next bucket doubles block size.
    pub bucket_count: u32,

    /// Free blocks unused for this many completed fence values are released.
    pub retention_frames: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        BucketConfig {
            heap_type: HeapType::Upload,
            resource_flags: ResourceFlags::empty(),
            initial_state: ResourceState::GenericRead,
            visibility_mask: 1,
            min_heap_size: 4 * 1024 * 1024,
            bucket_shift: 6,
            bucket_count: 22,
            retention_frames: 20,
        }
    }
}

impl BucketConfig {
    /// Bucket for `size` bytes aligned to `alignment`.
    /// May exceed `bucket_count` for requests that don't fit any bucket.
    pub fn bucket_index(&self, size: u64, alignment: u64) -> u32 {
        ceil_log2(size.max(alignment)).saturating_sub(self.bucket_shift)
    }

    /// Size of blocks in `bucket`.
    pub fn block_size(&self, bucket: u32) -> u64 {
        1 << (bucket + self.bucket_shift)
    }
}

/// Block allocated from `BucketAllocator`.
#[derive(Debug)]
pub struct BucketBlock {
    buffer: usize,
    offset: u64,
    bucket: u32,
}

#[derive(Debug)]
struct FreeBlock {
    block: BucketBlock,
    fence_value: u64,
}

#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
struct Backing<D: Device> {
    buffer: BackingBuffer<D>,

    /// Blocks of the buffer not purged yet.
    live_blocks: u64,
    block_size: u64,
}

#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
struct State<D: Device> {
    buffers: Slab<Backing<D>>,

    /// Free blocks ready for reuse, per bucket.
    available: Vec<VecDeque<FreeBlock>>,

    /// Deallocated blocks waiting for their fence value.
    expired: VecDeque<FreeBlock>,
}

/// Size-class allocator over committed buffers.
///
/// Each bucket keeps blocks of one power-of-two size.
/// Freed blocks return to their bucket once the GPU is done with them,
/// and blocks unused for `retention_frames` are purged,
/// destroying backing buffers that have no blocks left.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct BucketAllocator<D: Device> {
    #[derivative(Debug = "ignore")]
    device: Arc<D>,
    fence: Arc<Fence>,
    config: BucketConfig,
    state: Mutex<State<D>>,
    failed_allocations: AtomicU64,
}

impl<D> BucketAllocator<D>
where
    D: Device,
{
    /// Create new `BucketAllocator`.
    pub fn new(device: Arc<D>, fence: Arc<Fence>, config: BucketConfig) -> Self {
        assert!(config.bucket_count > 0, "Bucket allocator needs buckets");
        assert!(
            config.bucket_count + config.bucket_shift < 64,
            "Largest bucket overflows: {:?}",
            config
        );
        log::info!("Create new bucket allocator: {:#?}", config);

        BucketAllocator {
            device,
            fence,
            config,
            state: Mutex::new(State {
                buffers: Slab::new(),
                available: (0..config.bucket_count).map(|_| VecDeque::new()).collect(),
                expired: VecDeque::new(),
            }),
            failed_allocations: AtomicU64::new(0),
        }
    }

    /// Config this allocator was created with.
    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Size of the largest block.
    pub fn max_allocation(&self) -> u64 {
        self.config.block_size(self.config.bucket_count - 1)
    }

    /// Try to allocate `size` bytes aligned to `alignment`.
    ///
    /// Returns `false` if the request is larger than the largest bucket.
    pub fn try_allocate(
        self: &Arc<Self>,
        size: u64,
        alignment: u64,
        location: &mut ResourceLocation<D>,
    ) -> bool {
        let alignment = alignment.max(1);
        assert!(
            alignment.is_power_of_two(),
            "Bucket allocator alignment must be power of two, not {}",
            alignment
        );

        let bucket = self.config.bucket_index(size, alignment);
        if bucket >= self.config.bucket_count {
            self.failed_allocations.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "No bucket for {} bytes aligned to {}. Largest is {} bytes",
                size,
                alignment,
                self.max_allocation()
            );
            return false;
        }

        let mut state = self.state.lock();
        let reused = state.available[bucket as usize].pop_back();
        let block = match reused {
            Some(free) => free.block,
            None => self.create_blocks(&mut state, bucket),
        };

        let buffer = &state.buffers[block.buffer].buffer;
        let (gpu_address, mapped) = buffer.address(block.offset);
        let resource = buffer.resource_handle();
        let offset = block.offset;
        drop(state);

        log::trace!("Bucket allocation of {} bytes: {:?}", size, block);
        location.as_bucket(
            self.clone(),
            block,
            resource,
            offset,
            size,
            gpu_address,
            mapped,
        );
        true
    }

    /// Create backing buffer for `bucket`.
    /// All blocks but the first one go to the available queue.
    fn create_blocks(&self, state: &mut State<D>, bucket: u32) -> BucketBlock {
        let block_size = self.config.block_size(bucket);
        let size = self.config.min_heap_size.max(block_size) / block_size * block_size;
        let count = size / block_size;

        let buffer = BackingBuffer::create(
            &*self.device,
            HeapProperties {
                heap_type: self.config.heap_type,
                visibility_mask: self.config.visibility_mask,
            },
            size,
            self.config.resource_flags,
            self.config.initial_state,
        );
        let key = state.buffers.insert(Backing {
            buffer,
            live_blocks: count,
            block_size,
        });
        log::debug!(
            "Bucket {} got {} blocks of {} bytes",
            bucket,
            count,
            block_size
        );

        let fence_value = self.fence.current_value();
        let available = &mut state.available[bucket as usize];
        for index in (1..count).rev() {
            available.push_back(FreeBlock {
                block: BucketBlock {
                    buffer: key,
                    offset: index * block_size,
                    bucket,
                },
                fence_value,
            });
        }

        BucketBlock {
            buffer: key,
            offset: 0,
            bucket,
        }
    }

    /// Expire block. It becomes available once the GPU reaches the current fence value.
    pub(crate) fn deallocate(&self, block: BucketBlock) {
        let mut state = self.state.lock();
        let fence_value = self.fence.current_value();
        log::trace!("Expire {:?} until fence value {}", block, fence_value);
        state.expired.push_back(FreeBlock { block, fence_value });
    }

    /// Move expired blocks with completed fence values to their buckets,
    /// then purge blocks unused for `retention_frames`.
    pub fn clean_up_allocations(&self) {
        let mut state = self.state.lock();

        while let Some(front) = state.expired.front() {
            if !self.fence.is_complete(front.fence_value) {
                break;
            }
            if let Some(free) = state.expired.pop_front() {
                let bucket = free.block.bucket as usize;
                state.available[bucket].push_back(free);
            }
        }

        let completed = self.fence.last_completed_value();
        if completed <= self.config.retention_frames {
            return;
        }
        let threshold = completed - self.config.retention_frames;

        let mut purged = 0;
        for bucket in 0..state.available.len() {
            while state.available[bucket]
                .front()
                .map_or(false, |free| free.fence_value < threshold)
            {
                if let Some(free) = state.available[bucket].pop_front() {
                    self.purge(&mut state, free.block);
                    purged += 1;
                }
            }
        }

        if purged > 0 {
            log::debug!("Purged {} bucket blocks", purged);
        }
    }

    fn purge(&self, state: &mut State<D>, block: BucketBlock) {
        let backing = &mut state.buffers[block.buffer];
        backing.live_blocks -= 1;
        if backing.live_blocks == 0 {
            let backing = state.buffers.remove(block.buffer);
            log::debug!("Bucket buffer of {} bytes destroyed", backing.buffer.size());
            unsafe {
                self.device
                    .destroy_resource(backing.buffer.into_resource());
            }
        }
    }

    /// Number of requests larger than the largest bucket.
    pub fn failed_allocations(&self) -> u64 {
        self.failed_allocations.load(Ordering::Relaxed)
    }

    /// Number of backing buffers.
    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Collect allocator stats.
    /// Expired blocks count as used, purged ones count as neither used nor free.
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        let reserved: u64 = state.buffers.iter().map(|(_, backing)| backing.buffer.size()).sum();
        let live: u64 = state
            .buffers
            .iter()
            .map(|(_, backing)| backing.live_blocks * backing.block_size)
            .sum();
        let available: u64 = state
            .available
            .iter()
            .enumerate()
            .map(|(bucket, queue)| queue.len() as u64 * self.config.block_size(bucket as u32))
            .sum();

        AllocatorStats {
            kind: Kind::Bucket,
            heap_type: self.config.heap_type,
            reserved,
            used: live - available,
            backing_objects: state.buffers.len() as u64,
            failed_allocations: self.failed_allocations(),
        }
    }

    /// Destroy every backing buffer.
    ///
    /// GPU must not use any memory of this allocator.
    pub fn release_all_resources(&self) {
        let mut state = self.state.lock();
        let free = state.expired.len() + state.available.iter().map(VecDeque::len).sum::<usize>();
        let live: u64 = state.buffers.iter().map(|(_, backing)| backing.live_blocks).sum();
        if live != free as u64 {
            log::error!(
                "Bucket allocator released with {} blocks still allocated",
                live - free as u64
            );
        }

        state.expired.clear();
        for queue in &mut state.available {
            queue.clear();
        }
        for backing in state.buffers.drain() {
            unsafe {
                self.device
                    .destroy_resource(backing.buffer.into_resource());
            }
        }
    }
}

impl<D> Drop for BucketAllocator<D>
where
    D: Device,
{
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.buffers.is_empty() {
            log::error!(
                "Bucket allocator dropped with {} backing buffers",
                state.buffers.len()
            );
        }
    }
}
