use std::{
    collections::VecDeque,
    ops::Range,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use {
    hibitset::{BitSet, BitSetLike as _},
    parking_lot::Mutex,
    subheap_core::{
        Device, Fence, HeapDesc, HeapFlags, HeapProperties, HeapType, ResourceDesc,
        ResourceFlags, ResourceState, DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
        SMALL_RESOURCE_PLACEMENT_ALIGNMENT,
    },
};

use crate::{
    allocator::BackingBuffer,
    location::ResourceLocation,
    util::*,
    utilization::{AllocatorStats, Kind},
};

/// Shape of the backing object of a buddy allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AllocationStrategy {
    /// One heap. Every block gets its own placed resource,
    /// so blocks may be in different resource states.
    PlacedResource,

    /// One committed buffer. Blocks are byte ranges of it and share its state.
    /// Valid only for buffers that are read-only after creation.
    ManualSubAllocation,
}

/// Config for `BuddyAllocator`.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BuddyConfig {
    /// Shape of the backing object.
    pub strategy: AllocationStrategy,

    /// Size of order 0 blocks. Power of two.
    pub min_block_size: u64,

    /// Size of the backing object. Power of two multiple of `min_block_size`.
    pub max_block_size: u64,

    /// Memory pool of the backing object.
    pub heap_type: HeapType,

    /// Heap flags for `PlacedResource` strategy.
    pub heap_flags: HeapFlags,

    /// Flags of the backing buffer, or of placed buffers.
    pub resource_flags: ResourceFlags,

    /// State of the backing buffer, or of placed resources.
    pub initial_state: ResourceState,

    /// Nodes that can see the memory.
    pub visibility_mask: u32,
}

impl Default for BuddyConfig {
    fn default() -> Self {
        BuddyConfig {
            strategy: AllocationStrategy::ManualSubAllocation,
            min_block_size: 256,
            max_block_size: 4 * 1024 * 1024,
            heap_type: HeapType::Upload,
            heap_flags: HeapFlags::ALLOW_ONLY_BUFFERS,
            resource_flags: ResourceFlags::empty(),
            initial_state: ResourceState::GenericRead,
            visibility_mask: 1,
        }
    }
}

impl BuddyConfig {
    fn max_order(&self) -> u32 {
        ceil_log2(self.max_block_size / self.min_block_size)
    }

    fn padding(&self, alignment: u64) -> u64 {
        if self.min_block_size % alignment != 0 {
            alignment
        } else {
            0
        }
    }

    fn order_of(&self, size: u64, alignment: u64) -> u32 {
        let units = units(size + self.padding(alignment), self.min_block_size).max(1);
        ceil_log2(units)
    }

    /// Alignment buffers of this allocator are placed with.
    pub(crate) fn buffer_alignment(&self, alignment: u64) -> u64 {
        match self.strategy {
            AllocationStrategy::PlacedResource => alignment.max(DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT),
            AllocationStrategy::ManualSubAllocation => alignment,
        }
    }

    /// Check if an empty allocator with this config can hold
    /// `size` bytes aligned to `alignment`.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    pub fn fits(&self, size: u64, alignment: u64) -> bool {
        let alignment = alignment.max(1);
        assert!(
            alignment.is_power_of_two(),
            "Buddy allocator alignment must be power of two, not {}",
            alignment
        );
        size <= self.max_block_size && self.order_of(size, alignment) <= self.max_order()
    }
}

/// Block allocated from `BuddyAllocator`.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct BuddyBlock<D: Device> {
    /// Offset in units of `min_block_size`.
    offset: u32,
    order: u32,
    placed: Option<D::Resource>,
}

impl<D> BuddyBlock<D>
where
    D: Device,
{
    fn range(&self, min_block_size: u64) -> Range<u64> {
        let start = u64::from(self.offset) * min_block_size;
        start..start + (min_block_size << self.order)
    }
}

#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
enum Backing<D: Device> {
    Heap(D::Heap),
    Buffer(BackingBuffer<D>),
}

#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
struct RetiredBlock<D: Device> {
    block: BuddyBlock<D>,
    fence_value: u64,
}

#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
struct State<D: Device> {
    backing: Option<Backing<D>>,

    /// Free blocks of each order, indexed by `offset >> order`.
    #[derivative(Debug = "ignore")]
    free_blocks: Vec<BitSet>,

    /// Deallocated blocks waiting for their fence value.
    retired: VecDeque<RetiredBlock<D>>,

    /// Units held by allocated and retired blocks.
    used_units: u64,
}

/// Backing object of a reserved block.
enum Reserved<D: Device> {
    Heap(D::Heap),
    Buffer {
        resource: D::Resource,
        gpu_address: u64,
        mapped: Option<NonNull<u8>>,
    },
}

/// Block reserved from the free lists, not yet handed to a location.
struct Reservation<D: Device> {
    block: BuddyBlock<D>,
    aligned_offset: u64,
    backing: Reserved<D>,
}

/// Power-of-two buddy allocator over one heap or buffer of `max_block_size` bytes.
///
/// Freed blocks are retired with the current fence value
/// and merged back into the free lists by `clean_up_allocations`
/// once the GPU is done with them.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct BuddyAllocator<D: Device> {
    #[derivative(Debug = "ignore")]
    device: Arc<D>,
    fence: Arc<Fence>,
    config: BuddyConfig,
    max_order: u32,
    state: Mutex<State<D>>,
    failed_allocations: AtomicU64,
}

impl<D> BuddyAllocator<D>
where
    D: Device,
{
    /// Create new `BuddyAllocator`.
    /// Backing object is created on first allocation.
    pub fn new(device: Arc<D>, fence: Arc<Fence>, config: BuddyConfig) -> Self {
        assert!(
            config.min_block_size.is_power_of_two(),
            "Min block size must be power of two"
        );
        assert!(
            config.max_block_size.is_power_of_two() && config.max_block_size >= config.min_block_size,
            "Max block size must be power of two not smaller than min block size"
        );
        assert!(
            config.max_block_size / config.min_block_size <= u64::from(u32::max_value()),
            "Too many units in {:?}",
            config
        );
        if config.strategy == AllocationStrategy::PlacedResource {
            assert_eq!(
                config.min_block_size % SMALL_RESOURCE_PLACEMENT_ALIGNMENT,
                0,
                "Placed resources can't be smaller than {} bytes",
                SMALL_RESOURCE_PLACEMENT_ALIGNMENT
            );
        }

        let max_order = config.max_order();
        log::info!(
            "Create new buddy allocator: max order: {}, config: {:#?}",
            max_order,
            config
        );

        let mut free_blocks: Vec<BitSet> = (0..=max_order).map(|_| BitSet::new()).collect();
        free_blocks[max_order as usize].add(0);

        BuddyAllocator {
            device,
            fence,
            config,
            max_order,
            state: Mutex::new(State {
                backing: None,
                free_blocks,
                retired: VecDeque::new(),
                used_units: 0,
            }),
            failed_allocations: AtomicU64::new(0),
        }
    }

    /// Config this allocator was created with.
    pub fn config(&self) -> &BuddyConfig {
        &self.config
    }

    /// Highest order. Blocks of this order span the whole backing object.
    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    fn properties(&self) -> HeapProperties {
        HeapProperties {
            heap_type: self.config.heap_type,
            visibility_mask: self.config.visibility_mask,
        }
    }

    /// Check if request could be satisfied by an empty allocator.
    pub fn can_allocate(&self, size: u64, alignment: u64) -> bool {
        self.config.fits(size, alignment)
    }

    /// Try to allocate `size` bytes aligned to `alignment`
    /// from the committed buffer of `ManualSubAllocation` strategy,
    /// or as placed buffer of `PlacedResource` strategy.
    ///
    /// Returns `false` if there is no free block large enough.
    pub fn try_allocate(
        self: &Arc<Self>,
        size: u64,
        alignment: u64,
        location: &mut ResourceLocation<D>,
    ) -> bool {
        let allocated = self.allocate_uncounted(size, alignment, location);
        if !allocated {
            self.failed_allocations.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Buddy allocator is out of space for {} bytes aligned to {}",
                size,
                alignment
            );
        }
        allocated
    }

    /// Try to allocate placed resource described by `desc`.
    /// `PlacedResource` strategy only.
    ///
    /// Returns `false` if there is no free block large enough.
    pub fn try_allocate_placed(
        self: &Arc<Self>,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        location: &mut ResourceLocation<D>,
    ) -> bool {
        let allocated = self.allocate_placed_uncounted(desc, initial_state, location);
        if !allocated {
            self.failed_allocations.fetch_add(1, Ordering::Relaxed);
            log::warn!("Buddy allocator is out of space for {:?}", desc);
        }
        allocated
    }

    pub(crate) fn allocate_uncounted(
        self: &Arc<Self>,
        size: u64,
        alignment: u64,
        location: &mut ResourceLocation<D>,
    ) -> bool {
        match self.config.strategy {
            AllocationStrategy::ManualSubAllocation => {
                assert!(
                    alignment <= DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
                    "Backing buffer can't provide alignment {}",
                    alignment
                );
                let reservation = match self.reserve(size, alignment) {
                    Some(reservation) => reservation,
                    None => return false,
                };
                let (resource, gpu_address, mapped) = match reservation.backing {
                    Reserved::Buffer {
                        resource,
                        gpu_address,
                        mapped,
                    } => (resource, gpu_address, mapped),
                    Reserved::Heap(_) => unreachable!(),
                };
                let offset = reservation.aligned_offset;
                log::trace!(
                    "Buddy sub-allocation of {} bytes at {} ({:?})",
                    size,
                    offset,
                    reservation.block
                );
                location.as_buddy(
                    self.clone(),
                    reservation.block,
                    resource,
                    offset,
                    size,
                    gpu_address + offset,
                    mapped.map(|ptr| offset_ptr(ptr, offset)),
                );
                true
            }
            AllocationStrategy::PlacedResource => {
                let desc = ResourceDesc::buffer(size, self.config.resource_flags);
                self.allocate_placed_aligned(
                    &desc,
                    size,
                    self.config.buffer_alignment(alignment),
                    self.config.initial_state,
                    location,
                )
            }
        }
    }

    pub(crate) fn allocate_placed_uncounted(
        self: &Arc<Self>,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        location: &mut ResourceLocation<D>,
    ) -> bool {
        assert_eq!(
            self.config.strategy,
            AllocationStrategy::PlacedResource,
            "Placed resources require placed resource strategy"
        );
        let info = self.device.resource_allocation_info(desc);
        self.allocate_placed_aligned(desc, info.size, info.alignment, initial_state, location)
    }

    fn allocate_placed_aligned(
        self: &Arc<Self>,
        desc: &ResourceDesc,
        size: u64,
        alignment: u64,
        initial_state: ResourceState,
        location: &mut ResourceLocation<D>,
    ) -> bool {
        let Reservation {
            mut block,
            aligned_offset,
            backing,
        } = match self.reserve(size, alignment) {
            Some(reservation) => reservation,
            None => return false,
        };
        let heap = match backing {
            Reserved::Heap(heap) => heap,
            Reserved::Buffer { .. } => unreachable!(),
        };
        let offset = aligned_offset;

        let resource = self
            .device
            .create_placed_resource(&heap, offset, desc, initial_state)
            .unwrap_or_else(|err| {
                panic!(
                    "Failed to create placed resource {:?} at {}: {}",
                    desc, offset, err
                )
            });

        let (gpu_address, mapped) = if desc.is_buffer() {
            let mapped = if self.config.heap_type.is_cpu_visible() {
                Some(
                    unsafe { self.device.map(&resource) }
                        .unwrap_or_else(|err| panic!("Failed to map placed buffer: {}", err)),
                )
            } else {
                None
            };
            (self.device.gpu_virtual_address(&resource), mapped)
        } else {
            (0, None)
        };

        log::trace!(
            "Buddy placed resource of {} bytes at {} ({:?})",
            size,
            offset,
            block
        );
        block.placed = Some(resource.clone());
        let size = if desc.is_buffer() { desc.width } else { size };
        location.as_buddy(
            self.clone(),
            block,
            resource,
            0,
            size,
            gpu_address,
            mapped,
        );
        true
    }

    /// Take block large enough for `size` bytes aligned to `alignment`.
    fn reserve(&self, size: u64, alignment: u64) -> Option<Reservation<D>> {
        let alignment = alignment.max(1);
        if !self.can_allocate(size, alignment) {
            return None;
        }

        let padding = self.config.padding(alignment);
        let order = self.config.order_of(size, alignment);

        let mut state = self.state.lock();
        let offset = self.allocate_block(&mut state, order)?;
        state.used_units += 1 << order;

        if state.backing.is_none() {
            state.backing = Some(self.create_backing());
        }

        let block = BuddyBlock {
            offset,
            order,
            placed: None,
        };
        let block_range = block.range(self.config.min_block_size);
        let aligned_offset = aligned(block_range.start, alignment);
        assert!(
            aligned_offset + size <= block_range.end,
            "Padding {} doesn't fit {} bytes aligned to {} into block {:?}",
            padding,
            size,
            alignment,
            block_range
        );

        let backing = match &state.backing {
            Some(Backing::Heap(heap)) => Reserved::Heap(heap.clone()),
            Some(Backing::Buffer(buffer)) => {
                let (gpu_address, mapped) = buffer.address(0);
                Reserved::Buffer {
                    resource: buffer.resource_handle(),
                    gpu_address,
                    mapped,
                }
            }
            None => unreachable!(),
        };

        Some(Reservation {
            block,
            aligned_offset,
            backing,
        })
    }

    fn create_backing(&self) -> Backing<D> {
        match self.config.strategy {
            AllocationStrategy::PlacedResource => {
                let desc = HeapDesc {
                    size: self.config.max_block_size,
                    properties: self.properties(),
                    alignment: DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
                    flags: self.config.heap_flags,
                };
                let heap = self
                    .device
                    .create_heap(&desc)
                    .unwrap_or_else(|err| panic!("Failed to create buddy heap {:?}: {}", desc, err));
                log::debug!("Buddy heap created: {:?}", desc);
                Backing::Heap(heap)
            }
            AllocationStrategy::ManualSubAllocation => Backing::Buffer(BackingBuffer::create(
                &*self.device,
                self.properties(),
                self.config.max_block_size,
                self.config.resource_flags,
                self.config.initial_state,
            )),
        }
    }

    /// Pop free block of `order`, splitting larger blocks when required.
    /// Returns offset in units.
    fn allocate_block(&self, state: &mut State<D>, order: u32) -> Option<u32> {
        assert!(
            order <= self.max_order,
            "Order {} is above max order {}",
            order,
            self.max_order
        );

        let free = &mut state.free_blocks[order as usize];
        if let Some(index) = (&*free).iter().next() {
            let removed = free.remove(index);
            debug_assert!(removed);
            return Some(index << order);
        }

        if order == self.max_order {
            return None;
        }

        let left = self.allocate_block(state, order + 1)?;
        let right = left + (1 << order);
        let existed = state.free_blocks[order as usize].add(right >> order);
        debug_assert!(!existed);
        Some(left)
    }

    /// Put block back to free lists merging it with its buddy while possible.
    fn deallocate_block(&self, state: &mut State<D>, offset: u32, order: u32) {
        subheap_slow_assert!(
            !self.overlaps_free(state, offset, order),
            "Block of order {} at {} overlaps free block",
            order,
            offset
        );

        if order < self.max_order {
            let buddy = offset ^ (1 << order);
            if state.free_blocks[order as usize].remove(buddy >> order) {
                self.deallocate_block(state, offset.min(buddy), order + 1);
                return;
            }
        }

        let existed = state.free_blocks[order as usize].add(offset >> order);
        debug_assert!(!existed);
    }

    #[allow(dead_code)]
    fn overlaps_free(&self, state: &State<D>, offset: u32, order: u32) -> bool {
        let end = offset + (1 << order);
        (0..=self.max_order).any(|k| {
            let free = &state.free_blocks[k as usize];
            if k >= order {
                free.contains(offset >> k)
            } else {
                (offset >> k..end >> k).any(|index| free.contains(index))
            }
        })
    }

    /// Retire block. It becomes free once the GPU reaches the current fence value.
    pub(crate) fn deallocate(&self, block: BuddyBlock<D>) {
        let mut state = self.state.lock();
        let fence_value = self.fence.current_value();
        log::trace!("Retire {:?} until fence value {}", block, fence_value);
        state.retired.push_back(RetiredBlock { block, fence_value });
    }

    /// Return retired blocks with completed fence values to the free lists.
    pub fn clean_up_allocations(&self) {
        let mut state = self.state.lock();
        while let Some(retired) = state.retired.front() {
            if !self.fence.is_complete(retired.fence_value) {
                break;
            }
            let RetiredBlock { block, .. } = match state.retired.pop_front() {
                Some(retired) => retired,
                None => break,
            };
            if let Some(placed) = block.placed {
                unsafe {
                    self.device.destroy_resource(placed);
                }
            }
            state.used_units -= 1 << block.order;
            self.deallocate_block(&mut state, block.offset, block.order);
        }
    }

    /// Number of failed `try_allocate` calls.
    pub fn failed_allocations(&self) -> u64 {
        self.failed_allocations.load(Ordering::Relaxed)
    }

    /// Bytes held by allocated and retired blocks.
    pub fn used_size(&self) -> u64 {
        self.state.lock().used_units * self.config.min_block_size
    }

    /// Check if the whole backing object is one free block.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.retired.is_empty() && state.free_blocks[self.max_order as usize].contains(0)
    }

    /// Check if backing object is created.
    pub fn has_backing(&self) -> bool {
        self.state.lock().backing.is_some()
    }

    /// Free byte ranges, sorted by offset.
    pub fn free_blocks(&self) -> Vec<Range<u64>> {
        let state = self.state.lock();
        let min_block_size = self.config.min_block_size;
        let mut ranges: Vec<_> = state
            .free_blocks
            .iter()
            .enumerate()
            .flat_map(|(order, free)| {
                free.iter().map(move |index| {
                    let start = u64::from(index << order) * min_block_size;
                    start..start + (min_block_size << order)
                })
            })
            .collect();
        ranges.sort_by_key(|range| range.start);
        ranges
    }

    /// Collect allocator stats.
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        let has_backing = state.backing.is_some();
        AllocatorStats {
            kind: Kind::Buddy,
            heap_type: self.config.heap_type,
            reserved: if has_backing {
                self.config.max_block_size
            } else {
                0
            },
            used: state.used_units * self.config.min_block_size,
            backing_objects: has_backing as u64,
            failed_allocations: self.failed_allocations(),
        }
    }

    /// Destroy backing object and placed resources of retired blocks.
    /// Free lists are reset to one block of max order.
    ///
    /// GPU must not use any memory of this allocator.
    pub fn release_all_resources(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for retired in state.retired.drain(..) {
            if let Some(placed) = retired.block.placed {
                unsafe {
                    self.device.destroy_resource(placed);
                }
            }
            state.used_units -= 1 << retired.block.order;
        }

        if state.used_units != 0 {
            log::error!(
                "Buddy allocator released with {} bytes still allocated",
                state.used_units * self.config.min_block_size
            );
        }

        match state.backing.take() {
            Some(Backing::Heap(heap)) => unsafe { self.device.destroy_heap(heap) },
            Some(Backing::Buffer(buffer)) => unsafe {
                self.device.destroy_resource(buffer.into_resource())
            },
            None => {}
        }

        for free in &mut state.free_blocks {
            free.clear();
        }
        state.free_blocks[self.max_order as usize].add(0);
        state.used_units = 0;
    }
}

impl<D> Drop for BuddyAllocator<D>
where
    D: Device,
{
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.backing.is_some() {
            log::error!(
                "Buddy allocator dropped without releasing its {} bytes backing object",
                self.config.max_block_size
            );
        }
    }
}
