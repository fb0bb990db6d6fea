use std::{ptr::NonNull, sync::Arc};

use {
    relevant::Relevant,
    subheap_core::{
        Device, Fence, HeapFlags, HeapProperties, HeapType, ResourceDesc, ResourceFlags,
        ResourceState, DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT, SMALL_RESOURCE_PLACEMENT_ALIGNMENT,
    },
};

use crate::{
    allocator::{
        allocate_stand_alone, heap_initial_state, AllocationStrategy, BucketAllocator,
        BucketConfig, BuddyConfig, ConstantConfig, FastAllocator, FastConfig,
        FastConstantAllocator, FastPagePool, MultiBuddyAllocator,
    },
    deletion::DeferredDeletionQueue,
    location::ResourceLocation,
    utilization::TotalUtilization,
};

/// Allocator behind `Allocators::alloc_upload_resource`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PoolStrategy {
    /// Growable set of buddy allocators.
    /// Freed blocks coalesce as soon as their fence value completes.
    MultiBuddy,

    /// Power of two buckets.
    /// Freed blocks are kept for `retention_frames` before their memory is released.
    Bucket,
}

/// Config for `Allocators`.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AllocatorsConfig {
    /// Nodes that can see the memory. Overrides masks of the nested configs.
    pub visibility_mask: u32,

    /// Allocator used for upload buffers.
    pub pool_strategy: PoolStrategy,

    /// Upload pool for `PoolStrategy::MultiBuddy`.
    pub upload_pool: BuddyConfig,

    /// Upload pool for `PoolStrategy::Bucket`.
    pub upload_buckets: BucketConfig,

    /// Pool of read-only buffers in default heap.
    pub default_buffer_pool: BuddyConfig,

    /// Pool of shader writable buffers in default heap.
    pub uav_buffer_pool: BuddyConfig,

    /// Pool of small textures.
    pub texture_pool: BuddyConfig,

    /// Textures up to this size are placed into the texture pool.
    pub max_pooled_texture_size: u64,

    /// Config for the fast allocator.
    pub fast: FastConfig,

    /// Config for the constant allocator.
    pub constants: ConstantConfig,
}

impl Default for AllocatorsConfig {
    fn default() -> Self {
        const MB: u64 = 1024 * 1024;

        AllocatorsConfig {
            visibility_mask: 1,
            pool_strategy: PoolStrategy::MultiBuddy,
            upload_pool: BuddyConfig::default(),
            upload_buckets: BucketConfig::default(),
            default_buffer_pool: BuddyConfig {
                strategy: AllocationStrategy::ManualSubAllocation,
                min_block_size: 256,
                max_block_size: 4 * MB,
                heap_type: HeapType::Default,
                heap_flags: HeapFlags::ALLOW_ONLY_BUFFERS,
                resource_flags: ResourceFlags::empty(),
                initial_state: ResourceState::Common,
                visibility_mask: 1,
            },
            uav_buffer_pool: BuddyConfig {
                strategy: AllocationStrategy::PlacedResource,
                min_block_size: DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
                max_block_size: 4 * MB,
                heap_type: HeapType::Default,
                heap_flags: HeapFlags::ALLOW_ONLY_BUFFERS,
                resource_flags: ResourceFlags::ALLOW_UNORDERED_ACCESS,
                initial_state: ResourceState::UnorderedAccess,
                visibility_mask: 1,
            },
            texture_pool: BuddyConfig {
                strategy: AllocationStrategy::PlacedResource,
                min_block_size: SMALL_RESOURCE_PLACEMENT_ALIGNMENT,
                max_block_size: 4 * MB,
                heap_type: HeapType::Default,
                heap_flags: HeapFlags::ALLOW_ONLY_NON_RT_DS_TEXTURES,
                resource_flags: ResourceFlags::empty(),
                initial_state: ResourceState::Common,
                visibility_mask: 1,
            },
            max_pooled_texture_size: DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
            fast: FastConfig::default(),
            constants: ConstantConfig::default(),
        }
    }
}

#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
enum UploadPool<D: Device> {
    MultiBuddy(MultiBuddyAllocator<D>),
    Bucket(Arc<BucketAllocator<D>>),
}

impl<D> UploadPool<D>
where
    D: Device,
{
    fn fits(&self, size: u64, alignment: u64) -> bool {
        match self {
            UploadPool::MultiBuddy(pool) => pool.can_allocate(size, alignment),
            UploadPool::Bucket(pool) => size.max(alignment) <= pool.max_allocation(),
        }
    }

    fn try_allocate(&self, size: u64, alignment: u64, location: &mut ResourceLocation<D>) -> bool {
        match self {
            UploadPool::MultiBuddy(pool) => pool.try_allocate(size, alignment, location),
            UploadPool::Bucket(pool) => pool.try_allocate(size, alignment, location),
        }
    }

    fn clean_up_allocations(&self) {
        match self {
            UploadPool::MultiBuddy(pool) => pool.clean_up_allocations(),
            UploadPool::Bucket(pool) => pool.clean_up_allocations(),
        }
    }

    fn release_all_resources(&self) {
        match self {
            UploadPool::MultiBuddy(pool) => pool.release_all_resources(),
            UploadPool::Bucket(pool) => pool.release_all_resources(),
        }
    }
}

/// Every allocator of one device and node mask.
///
/// Requests are routed to a pool when they are small enough,
/// anything else gets a stand-alone committed resource.
/// Must be torn down with `dispose` once the GPU is idle.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Allocators<D: Device> {
    #[derivative(Debug = "ignore")]
    device: Arc<D>,
    fence: Arc<Fence>,
    config: AllocatorsConfig,
    fast: FastAllocator<D>,
    constants: FastConstantAllocator<D>,
    upload: UploadPool<D>,
    default_buffers: MultiBuddyAllocator<D>,
    uav_buffers: MultiBuddyAllocator<D>,
    textures: MultiBuddyAllocator<D>,
    fast_pool: Arc<FastPagePool<D>>,
    deletion: DeferredDeletionQueue<D>,
    relevant: Relevant,
}

impl<D> Allocators<D>
where
    D: Device,
{
    /// Create allocators for `device`.
    /// No memory is reserved until first allocation.
    pub fn new(device: Arc<D>, fence: Arc<Fence>, mut config: AllocatorsConfig) -> Self {
        let mask = config.visibility_mask;
        config.upload_pool.visibility_mask = mask;
        config.upload_buckets.visibility_mask = mask;
        config.default_buffer_pool.visibility_mask = mask;
        config.uav_buffer_pool.visibility_mask = mask;
        config.texture_pool.visibility_mask = mask;
        config.fast.visibility_mask = mask;
        config.constants.visibility_mask = mask;

        assert_eq!(
            config.default_buffer_pool.strategy,
            AllocationStrategy::ManualSubAllocation,
            "Read-only buffers are sub-allocated from one buffer"
        );
        assert_eq!(
            config.uav_buffer_pool.strategy,
            AllocationStrategy::PlacedResource,
            "Shader writable buffers need their own resource"
        );
        assert_eq!(
            config.texture_pool.strategy,
            AllocationStrategy::PlacedResource,
            "Textures can only be placed"
        );

        log::info!("Create allocators for nodes {:#x}", mask);

        let deletion = DeferredDeletionQueue::new(device.clone(), fence.clone());
        let upload = match config.pool_strategy {
            PoolStrategy::MultiBuddy => UploadPool::MultiBuddy(MultiBuddyAllocator::new(
                device.clone(),
                fence.clone(),
                config.upload_pool,
            )),
            PoolStrategy::Bucket => UploadPool::Bucket(Arc::new(BucketAllocator::new(
                device.clone(),
                fence.clone(),
                config.upload_buckets,
            ))),
        };
        let fast_pool = Arc::new(FastPagePool::new(
            device.clone(),
            fence.clone(),
            config.fast,
        ));

        Allocators {
            fast: FastAllocator::new(fast_pool.clone(), deletion.sender()),
            constants: FastConstantAllocator::new(
                device.clone(),
                fence.clone(),
                deletion.sender(),
                config.constants,
            ),
            upload,
            default_buffers: MultiBuddyAllocator::new(
                device.clone(),
                fence.clone(),
                config.default_buffer_pool,
            ),
            uav_buffers: MultiBuddyAllocator::new(
                device.clone(),
                fence.clone(),
                config.uav_buffer_pool,
            ),
            textures: MultiBuddyAllocator::new(device.clone(), fence.clone(), config.texture_pool),
            fast_pool,
            deletion,
            device,
            fence,
            config,
            relevant: Relevant,
        }
    }

    /// Device the memory comes from.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Fence that gates reuse of freed memory.
    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    /// Config these allocators were created with.
    pub fn config(&self) -> &AllocatorsConfig {
        &self.config
    }

    fn properties(&self, heap_type: HeapType) -> HeapProperties {
        HeapProperties {
            heap_type,
            visibility_mask: self.config.visibility_mask,
        }
    }

    /// Allocate `size` bytes of CPU writable memory aligned to `alignment`.
    ///
    /// Returns CPU address of the allocation.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two or exceeds placement alignment.
    pub fn alloc_upload_resource(
        &self,
        size: u64,
        alignment: u64,
        location: &mut ResourceLocation<D>,
    ) -> NonNull<u8> {
        let alignment = alignment.max(1);
        assert_buffer_alignment(alignment);
        if !(self.upload.fits(size, alignment) && self.upload.try_allocate(size, alignment, location))
        {
            log::trace!("Upload buffer of {} bytes is stand-alone", size);
            allocate_stand_alone(
                &*self.device,
                self.properties(HeapType::Upload),
                &ResourceDesc::buffer(size, ResourceFlags::empty()),
                heap_initial_state(HeapType::Upload),
                self.deletion.sender(),
                location,
            );
        }

        match location.mapped_base_address() {
            Some(mapped) => mapped,
            None => unreachable!("Upload memory is always mapped"),
        }
    }

    /// Allocate buffer in default heap.
    ///
    /// Buffers smaller than a pool block that aren't a multiple of the
    /// placement alignment are pooled. Shader writable buffers get placed resources,
    /// read-only buffers share the pool buffer and its `initial_state`.
    pub fn alloc_default_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        alignment: u64,
        location: &mut ResourceLocation<D>,
    ) {
        assert!(desc.is_buffer(), "Use `allocate_texture` for {:?}", desc);
        let alignment = alignment.max(desc.alignment).max(1);
        assert_buffer_alignment(alignment);

        let pooled = desc.width % DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT != 0 && {
            if desc.flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS) {
                desc.width < self.config.uav_buffer_pool.max_block_size
                    && self
                        .uav_buffers
                        .try_allocate_placed(desc, initial_state, location)
            } else {
                desc.width < self.config.default_buffer_pool.max_block_size
                    && initial_state == self.config.default_buffer_pool.initial_state
                    && self
                        .default_buffers
                        .try_allocate(desc.width, alignment, location)
            }
        };

        if !pooled {
            log::trace!("Default buffer of {} bytes is stand-alone", desc.width);
            allocate_stand_alone(
                &*self.device,
                self.properties(HeapType::Default),
                desc,
                initial_state,
                self.deletion.sender(),
                location,
            );
        }
    }

    /// Allocate texture in default heap.
    ///
    /// Small textures that are neither render targets nor depth stencils are placed
    /// into the texture pool.
    pub fn allocate_texture(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        location: &mut ResourceLocation<D>,
    ) {
        assert!(!desc.is_buffer(), "Use `alloc_default_resource` for {:?}", desc);

        let pooled = !desc.is_rt_or_ds()
            && self.device.resource_allocation_info(desc).size <= self.config.max_pooled_texture_size
            && self.textures.try_allocate_placed(desc, initial_state, location);

        if !pooled {
            log::trace!("Texture {:?} is stand-alone", desc);
            allocate_stand_alone(
                &*self.device,
                self.properties(HeapType::Default),
                desc,
                initial_state,
                self.deletion.sender(),
                location,
            );
        }
    }

    /// Allocator for data that lives for one frame.
    pub fn fast_allocator(&self) -> &FastAllocator<D> {
        &self.fast
    }

    /// Allocator for constant data.
    pub fn constant_allocator(&self) -> &FastConstantAllocator<D> {
        &self.constants
    }

    /// Queue for objects that must outlive the GPU work submitted so far.
    pub fn deletion_queue(&self) -> &DeferredDeletionQueue<D> {
        &self.deletion
    }

    /// Reclaim memory whose fence values completed.
    /// Supposed to be called once per frame.
    pub fn clean_up_allocations(&self) {
        self.upload.clean_up_allocations();
        self.default_buffers.clean_up_allocations();
        self.uav_buffers.clean_up_allocations();
        self.textures.clean_up_allocations();
        self.fast_pool.clean_up_pages(self.config.fast.frame_lag);

        let released = self.deletion.release_resources(false);
        if released > 0 {
            log::trace!("Released {} deferred objects", released);
        }
    }

    /// Collect stats of every allocator.
    pub fn utilization(&self) -> TotalUtilization {
        let upload = match &self.upload {
            UploadPool::MultiBuddy(pool) => pool.stats(),
            UploadPool::Bucket(pool) => pool.stats(),
        };

        TotalUtilization {
            allocators: vec![
                ("upload", upload),
                ("default buffers", self.default_buffers.stats()),
                ("uav buffers", self.uav_buffers.stats()),
                ("textures", self.textures.stats()),
                ("fast pages", self.fast_pool.stats()),
                ("constants", self.constants.stats()),
            ],
        }
    }

    /// Destroy every backing object.
    ///
    /// GPU must be idle. Locations still allocated from these allocators must not be used.
    pub fn dispose(self) {
        self.fast.destroy();
        self.fast_pool.destroy();
        self.constants.destroy();
        self.upload.release_all_resources();
        self.default_buffers.release_all_resources();
        self.uav_buffers.release_all_resources();
        self.textures.release_all_resources();

        let released = self.deletion.release_resources(true);
        log::info!("Allocators disposed, {} deferred objects released", released);
        self.relevant.dispose();
    }
}

/// Same limits for every pool, stand-alone resources included.
fn assert_buffer_alignment(alignment: u64) {
    assert!(
        alignment.is_power_of_two() && alignment <= DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
        "Buffer alignment must be power of two up to {}, not {}",
        DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
        alignment
    );
}
