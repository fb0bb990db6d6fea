//! Allocators that carve big heaps and buffers into `ResourceLocation`s.

mod bucket;
mod buddy;
mod constant;
mod fast;
mod multi_buddy;
mod ring;

use std::ptr::NonNull;

use subheap_core::{
    Device, HeapProperties, HeapType, ResourceDesc, ResourceFlags, ResourceState,
};

use crate::{deletion::DeletionSender, location::ResourceLocation, util::offset_ptr};

pub use self::{
    bucket::{BucketAllocator, BucketBlock, BucketConfig},
    buddy::{AllocationStrategy, BuddyAllocator, BuddyBlock, BuddyConfig},
    constant::{ConstantConfig, FastConstantAllocator},
    fast::{FastAllocator, FastConfig, FastPage, FastPagePool},
    multi_buddy::MultiBuddyAllocator,
    ring::RingBuffer,
};

/// Committed buffer that allocators sub-allocate from.
/// CPU visible buffers are mapped persistently for their whole life.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub(crate) struct BackingBuffer<D: Device> {
    resource: D::Resource,
    gpu_address: u64,
    mapped: Option<NonNull<u8>>,
    size: u64,
}

unsafe impl<D> Send for BackingBuffer<D> where D: Device {}
unsafe impl<D> Sync for BackingBuffer<D> where D: Device {}

impl<D> BackingBuffer<D>
where
    D: Device,
{
    /// Create new buffer.
    ///
    /// # Panics
    ///
    /// Panics if device fails to create or map the buffer.
    pub(crate) fn create(
        device: &D,
        properties: HeapProperties,
        size: u64,
        flags: ResourceFlags,
        initial_state: ResourceState,
    ) -> Self {
        let (resource, gpu_address, mapped) =
            create_committed_buffer(device, properties, size, flags, initial_state);
        log::debug!(
            "Backing buffer created: {} bytes in {:?} heap",
            size,
            properties.heap_type
        );

        BackingBuffer {
            resource,
            gpu_address,
            mapped,
            size,
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// GPU and CPU address of the byte at `offset`.
    pub(crate) fn address(&self, offset: u64) -> (u64, Option<NonNull<u8>>) {
        debug_assert!(offset <= self.size);
        (
            self.gpu_address + offset,
            self.mapped.map(|ptr| offset_ptr(ptr, offset)),
        )
    }

    pub(crate) fn resource_handle(&self) -> D::Resource {
        self.resource.clone()
    }

    pub(crate) fn into_resource(self) -> D::Resource {
        self.resource
    }
}

/// State resources in `heap_type` heaps are created in.
pub(crate) fn heap_initial_state(heap_type: HeapType) -> ResourceState {
    match heap_type {
        HeapType::Default => ResourceState::Common,
        HeapType::Upload => ResourceState::GenericRead,
        HeapType::Readback => ResourceState::CopyDest,
    }
}

/// Create committed buffer, mapping it if CPU visible.
pub(crate) fn create_committed_buffer<D: Device>(
    device: &D,
    properties: HeapProperties,
    size: u64,
    flags: ResourceFlags,
    initial_state: ResourceState,
) -> (D::Resource, u64, Option<NonNull<u8>>) {
    let desc = ResourceDesc::buffer(size, flags);
    let resource = device
        .create_committed_resource(&properties, &desc, initial_state)
        .unwrap_or_else(|err| {
            panic!(
                "Failed to create {} bytes buffer in {:?} heap: {}",
                size, properties.heap_type, err
            )
        });

    let mapped = if properties.heap_type.is_cpu_visible() {
        let ptr = unsafe { device.map(&resource) }
            .unwrap_or_else(|err| panic!("Failed to map {} bytes buffer: {}", size, err));
        Some(ptr)
    } else {
        None
    };

    let gpu_address = device.gpu_virtual_address(&resource);
    (resource, gpu_address, mapped)
}

/// Allocate resource with its own memory and hand it to `location`.
pub(crate) fn allocate_stand_alone<D: Device>(
    device: &D,
    properties: HeapProperties,
    desc: &ResourceDesc,
    initial_state: ResourceState,
    deletion: DeletionSender<D>,
    location: &mut ResourceLocation<D>,
) {
    if desc.is_buffer() {
        let (resource, gpu_address, mapped) =
            create_committed_buffer(device, properties, desc.width, desc.flags, initial_state);
        log::trace!("Stand-alone buffer of {} bytes", desc.width);
        location.as_stand_alone(resource, desc.width, gpu_address, mapped, deletion);
    } else {
        let resource = device
            .create_committed_resource(&properties, desc, initial_state)
            .unwrap_or_else(|err| panic!("Failed to create texture {:?}: {}", desc, err));
        let size = device.resource_allocation_info(desc).size;
        log::trace!("Stand-alone texture of {} bytes", size);
        location.as_stand_alone(resource, size, 0, None, deletion);
    }
}
