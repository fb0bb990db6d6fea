use std::{ptr::NonNull, sync::Arc};

use subheap_core::Device;

use crate::{
    allocator::{BucketAllocator, BucketBlock, BuddyAllocator, BuddyBlock, FastPage},
    deletion::{DeletionSender, Garbage},
    heap::SharedHeap,
};

/// What a `ResourceLocation` refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocationKind {
    /// Location is empty.
    Undefined,

    /// Resource with its own memory, owned by the location.
    StandAlone,

    /// Range of a heap or buffer owned by a buddy or bucket allocator.
    SubAllocation,

    /// Transient range of a fast allocator page or constant ring.
    FastAllocation,

    /// Placed resource in a heap shared between locations.
    Aliased,
}

/// Allocator private data of the location.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
enum Payload<D: Device> {
    Undefined,
    StandAlone {
        deletion: DeletionSender<D>,
    },
    Buddy {
        #[derivative(Debug = "ignore")]
        allocator: Arc<BuddyAllocator<D>>,
        block: BuddyBlock<D>,
    },
    Bucket {
        #[derivative(Debug = "ignore")]
        allocator: Arc<BucketAllocator<D>>,
        block: BucketBlock,
    },
    Fast {
        #[derivative(Debug = "ignore")]
        page: Option<Arc<FastPage<D>>>,
    },
    Aliased {
        heap: Arc<SharedHeap<D>>,
    },
}

/// Where a logical allocation lives.
///
/// Location owns no memory except for stand-alone resources.
/// It is created empty, populated once by one of the allocators
/// and returns its memory to the owner on `clear` or drop.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct ResourceLocation<D: Device> {
    payload: Payload<D>,
    resource: Option<D::Resource>,
    offset_from_base: u64,
    size: u64,
    gpu_virtual_address: u64,
    mapped: Option<NonNull<u8>>,
}

unsafe impl<D> Send for ResourceLocation<D> where D: Device {}
unsafe impl<D> Sync for ResourceLocation<D> where D: Device {}

impl<D> Default for ResourceLocation<D>
where
    D: Device,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<D> ResourceLocation<D>
where
    D: Device,
{
    /// Create empty location.
    pub fn new() -> Self {
        ResourceLocation {
            payload: Payload::Undefined,
            resource: None,
            offset_from_base: 0,
            size: 0,
            gpu_virtual_address: 0,
            mapped: None,
        }
    }

    /// Get kind of the location.
    pub fn kind(&self) -> LocationKind {
        match self.payload {
            Payload::Undefined => LocationKind::Undefined,
            Payload::StandAlone { .. } => LocationKind::StandAlone,
            Payload::Buddy { .. } | Payload::Bucket { .. } => LocationKind::SubAllocation,
            Payload::Fast { .. } => LocationKind::FastAllocation,
            Payload::Aliased { .. } => LocationKind::Aliased,
        }
    }

    /// Check if location refers to an allocation.
    pub fn is_valid(&self) -> bool {
        self.kind() != LocationKind::Undefined
    }

    /// Resource the allocation lives in.
    pub fn resource(&self) -> Option<&D::Resource> {
        self.resource.as_ref()
    }

    /// Offset of the allocation from the start of the resource.
    pub fn offset_from_base(&self) -> u64 {
        self.offset_from_base
    }

    /// Requested size of the allocation.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// GPU virtual address of the first byte of the allocation.
    /// `0` for textures.
    pub fn gpu_virtual_address(&self) -> u64 {
        self.gpu_virtual_address
    }

    /// CPU address of the first byte of the allocation,
    /// if the allocation lives in CPU visible memory.
    pub fn mapped_base_address(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    /// Move allocation from `source` into this location.
    /// Previous allocation of this location is released and `source` is left empty.
    pub fn transfer_ownership(&mut self, source: &mut Self) {
        self.clear();
        std::mem::swap(self, source);
    }

    /// Return allocation to its owner and make location empty.
    pub fn clear(&mut self) {
        let payload = std::mem::replace(&mut self.payload, Payload::Undefined);
        let resource = self.resource.take();

        match payload {
            Payload::Undefined => {}
            Payload::StandAlone { deletion } => {
                if let Some(resource) = resource {
                    deletion.defer(Garbage::Resource(resource));
                }
            }
            Payload::Buddy { allocator, block } => allocator.deallocate(block),
            Payload::Bucket { allocator, block } => allocator.deallocate(block),
            Payload::Fast { page } => drop(page),
            Payload::Aliased { heap } => {
                if let Some(resource) = resource {
                    heap.defer_resource(resource);
                }
            }
        }

        self.offset_from_base = 0;
        self.size = 0;
        self.gpu_virtual_address = 0;
        self.mapped = None;
    }

    fn populate(
        &mut self,
        payload: Payload<D>,
        resource: D::Resource,
        offset_from_base: u64,
        size: u64,
        gpu_virtual_address: u64,
        mapped: Option<NonNull<u8>>,
    ) {
        assert!(
            !self.is_valid(),
            "Location is already populated: {:?}",
            self
        );
        self.payload = payload;
        self.resource = Some(resource);
        self.offset_from_base = offset_from_base;
        self.size = size;
        self.gpu_virtual_address = gpu_virtual_address;
        self.mapped = mapped;
    }

    pub(crate) fn as_stand_alone(
        &mut self,
        resource: D::Resource,
        size: u64,
        gpu_virtual_address: u64,
        mapped: Option<NonNull<u8>>,
        deletion: DeletionSender<D>,
    ) {
        self.populate(
            Payload::StandAlone { deletion },
            resource,
            0,
            size,
            gpu_virtual_address,
            mapped,
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn as_buddy(
        &mut self,
        allocator: Arc<BuddyAllocator<D>>,
        block: BuddyBlock<D>,
        resource: D::Resource,
        offset_from_base: u64,
        size: u64,
        gpu_virtual_address: u64,
        mapped: Option<NonNull<u8>>,
    ) {
        self.populate(
            Payload::Buddy { allocator, block },
            resource,
            offset_from_base,
            size,
            gpu_virtual_address,
            mapped,
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn as_bucket(
        &mut self,
        allocator: Arc<BucketAllocator<D>>,
        block: BucketBlock,
        resource: D::Resource,
        offset_from_base: u64,
        size: u64,
        gpu_virtual_address: u64,
        mapped: Option<NonNull<u8>>,
    ) {
        self.populate(
            Payload::Bucket { allocator, block },
            resource,
            offset_from_base,
            size,
            gpu_virtual_address,
            mapped,
        );
    }

    pub(crate) fn as_fast_allocation(
        &mut self,
        page: Option<Arc<FastPage<D>>>,
        resource: D::Resource,
        offset_from_base: u64,
        size: u64,
        gpu_virtual_address: u64,
        mapped: Option<NonNull<u8>>,
    ) {
        self.populate(
            Payload::Fast { page },
            resource,
            offset_from_base,
            size,
            gpu_virtual_address,
            mapped,
        );
    }

    pub(crate) fn as_heap_aliased(
        &mut self,
        heap: Arc<SharedHeap<D>>,
        resource: D::Resource,
        size: u64,
        gpu_virtual_address: u64,
    ) {
        self.populate(
            Payload::Aliased { heap },
            resource,
            0,
            size,
            gpu_virtual_address,
            None,
        );
    }
}

impl<D> Drop for ResourceLocation<D>
where
    D: Device,
{
    fn drop(&mut self) {
        self.clear();
    }
}
