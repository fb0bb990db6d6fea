use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use {
    parking_lot::Mutex,
    smallvec::SmallVec,
    subheap_core::{Device, Fence, ResourceDesc, ResourceState},
};

use crate::{
    allocator::{BuddyAllocator, BuddyConfig},
    location::ResourceLocation,
    utilization::{AllocatorStats, Kind},
};

/// Growable pool of identically configured `BuddyAllocator`s.
///
/// New allocator is created when every existing one is out of space.
/// Empty allocators are destroyed by `clean_up_allocations`.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct MultiBuddyAllocator<D: Device> {
    #[derivative(Debug = "ignore")]
    device: Arc<D>,
    fence: Arc<Fence>,
    config: BuddyConfig,
    allocators: Mutex<Vec<Arc<BuddyAllocator<D>>>>,
    failed_allocations: AtomicU64,
}

impl<D> MultiBuddyAllocator<D>
where
    D: Device,
{
    /// Create new `MultiBuddyAllocator`.
    /// No allocator is created until first allocation.
    pub fn new(device: Arc<D>, fence: Arc<Fence>, config: BuddyConfig) -> Self {
        log::info!("Create new multi buddy allocator: {:#?}", config);
        MultiBuddyAllocator {
            device,
            fence,
            config,
            allocators: Mutex::new(Vec::new()),
            failed_allocations: AtomicU64::new(0),
        }
    }

    /// Config of the allocators in the pool.
    pub fn config(&self) -> &BuddyConfig {
        &self.config
    }

    fn create_allocator(&self) -> Arc<BuddyAllocator<D>> {
        Arc::new(BuddyAllocator::new(
            self.device.clone(),
            self.fence.clone(),
            self.config,
        ))
    }

    /// Check if request fits into one allocator.
    pub fn can_allocate(&self, size: u64, alignment: u64) -> bool {
        self.config.fits(size, self.config.buffer_alignment(alignment))
    }

    /// Try to allocate `size` bytes aligned to `alignment`.
    ///
    /// Returns `false` only if the request is larger than one allocator.
    pub fn try_allocate(&self, size: u64, alignment: u64, location: &mut ResourceLocation<D>) -> bool {
        self.allocate_with(
            |allocator, location| allocator.allocate_uncounted(size, alignment, location),
            self.can_allocate(size, alignment),
            location,
        )
    }

    /// Try to allocate placed resource described by `desc`.
    /// Requires `PlacedResource` strategy.
    pub fn try_allocate_placed(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        location: &mut ResourceLocation<D>,
    ) -> bool {
        let info = self.device.resource_allocation_info(desc);
        self.allocate_with(
            |allocator, location| allocator.allocate_placed_uncounted(desc, initial_state, location),
            self.config.fits(info.size, info.alignment),
            location,
        )
    }

    fn allocate_with(
        &self,
        allocate: impl Fn(&Arc<BuddyAllocator<D>>, &mut ResourceLocation<D>) -> bool,
        fits: bool,
        location: &mut ResourceLocation<D>,
    ) -> bool {
        if !fits {
            self.failed_allocations.fetch_add(1, Ordering::Relaxed);
            log::warn!("Request doesn't fit into one buddy allocator: {:?}", self.config);
            return false;
        }

        let mut allocators = self.allocators.lock();

        for allocator in allocators.iter() {
            if allocate(allocator, location) {
                return true;
            }
        }

        let allocator = self.create_allocator();
        log::debug!(
            "Buddy allocator #{} added to the pool",
            allocators.len()
        );
        let allocated = allocate(&allocator, location);
        assert!(allocated, "Fresh buddy allocator must satisfy the request");
        allocators.push(allocator);
        true
    }

    /// Clean up every allocator, then destroy empty ones.
    pub fn clean_up_allocations(&self) {
        let mut allocators = self.allocators.lock();
        for allocator in allocators.iter() {
            allocator.clean_up_allocations();
        }

        let before = allocators.len();
        allocators.retain(|allocator| {
            if allocator.is_empty() {
                allocator.release_all_resources();
                false
            } else {
                true
            }
        });

        if allocators.len() != before {
            log::debug!(
                "Trimmed {} empty buddy allocators, {} left",
                before - allocators.len(),
                allocators.len()
            );
        }
    }

    /// Number of allocators in the pool.
    pub fn allocator_count(&self) -> usize {
        self.allocators.lock().len()
    }

    /// Number of requests too large for one allocator.
    pub fn failed_allocations(&self) -> u64 {
        self.failed_allocations.load(Ordering::Relaxed)
    }

    /// Collect stats summed over the pool.
    pub fn stats(&self) -> AllocatorStats {
        let allocators = self.allocators.lock();
        allocators.iter().map(|allocator| allocator.stats()).fold(
            AllocatorStats {
                kind: Kind::MultiBuddy,
                heap_type: self.config.heap_type,
                reserved: 0,
                used: 0,
                backing_objects: 0,
                failed_allocations: self.failed_allocations(),
            },
            |mut total, stats| {
                total.reserved += stats.reserved;
                total.used += stats.used;
                total.backing_objects += stats.backing_objects;
                total
            },
        )
    }

    /// Destroy every allocator in the pool.
    ///
    /// GPU must not use any memory of this pool.
    pub fn release_all_resources(&self) {
        let allocators: SmallVec<[_; 8]> = self.allocators.lock().drain(..).collect();
        for allocator in allocators {
            allocator.release_all_resources();
        }
    }
}
