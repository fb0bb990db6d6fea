use std::sync::Arc;

use subheap_core::{Device, HeapDesc, ResourceDesc, ResourceState};

use crate::{
    deletion::{DeletionSender, Garbage},
    location::ResourceLocation,
};

/// Heap shared by resources aliasing its memory.
///
/// Every `ResourceLocation` created with `create_aliased` holds a reference.
/// Heap destruction is deferred when the last reference goes away.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct SharedHeap<D: Device> {
    #[derivative(Debug = "ignore")]
    device: Arc<D>,
    heap: D::Heap,
    desc: HeapDesc,
    deletion: DeletionSender<D>,
}

impl<D> SharedHeap<D>
where
    D: Device,
{
    /// Create new heap.
    ///
    /// # Panics
    ///
    /// Panics if device fails to create the heap.
    pub fn new(device: Arc<D>, desc: &HeapDesc, deletion: DeletionSender<D>) -> Arc<Self> {
        let heap = device
            .create_heap(desc)
            .unwrap_or_else(|err| panic!("Failed to create shared heap {:?}: {}", desc, err));
        log::info!("Shared heap created: {:?}", desc);

        Arc::new(SharedHeap {
            device,
            heap,
            desc: *desc,
            deletion,
        })
    }

    /// Size of the heap in bytes.
    pub fn size(&self) -> u64 {
        self.desc.size
    }

    /// Raw heap handle.
    pub fn raw(&self) -> &D::Heap {
        &self.heap
    }

    /// Create resource placed at `offset` in this heap
    /// and populate `location` with it.
    ///
    /// # Panics
    ///
    /// Panics if device fails to create the resource.
    pub fn create_aliased(
        self: &Arc<Self>,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        location: &mut ResourceLocation<D>,
    ) {
        let info = self.device.resource_allocation_info(desc);
        assert!(
            offset + info.size <= self.desc.size,
            "Aliased resource {:?} at {} doesn't fit heap of size {}",
            desc,
            offset,
            self.desc.size
        );

        let resource = self
            .device
            .create_placed_resource(self.raw(), offset, desc, initial_state)
            .unwrap_or_else(|err| panic!("Failed to create aliased resource {:?}: {}", desc, err));

        let gpu_virtual_address = if desc.is_buffer() {
            self.device.gpu_virtual_address(&resource)
        } else {
            0
        };

        location.as_heap_aliased(self.clone(), resource, desc.width, gpu_virtual_address);
    }

    pub(crate) fn defer_resource(&self, resource: D::Resource) {
        self.deletion.defer(Garbage::Resource(resource));
    }
}

impl<D> Drop for SharedHeap<D>
where
    D: Device,
{
    fn drop(&mut self) {
        self.deletion.defer(Garbage::Heap(self.heap.clone()));
    }
}
