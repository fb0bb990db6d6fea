mod allocators;

use std::{collections::HashMap, ptr::NonNull};

use {
    parking_lot::Mutex,
    subheap_core::{
        AllocationInfo, Device, Fence, HeapDesc, HeapProperties, MappingError, OutOfMemory,
        ResourceDesc, ResourceDimension, ResourceState, DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
        SMALL_RESOURCE_PLACEMENT_ALIGNMENT,
    },
};

use crate::util::aligned;

/// Submit current fence value and complete it right away.
pub(crate) fn retire_frame(fence: &Fence) {
    let submitted = fence.advance();
    fence.signal_completed(submitted);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct MockResource(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct MockHeap(u64);

enum Host {
    None,
    Owned(Box<[u8]>),
    Placed(usize),
}

struct ResourceEntry {
    dimension: ResourceDimension,
    gpu_address: u64,
    host: Host,
    heap: Option<MockHeap>,
}

struct HeapEntry {
    size: u64,
    gpu_address: u64,
    host: Option<Box<[u8]>>,
    placed: usize,
}

struct Inner {
    next_id: u64,
    next_address: u64,
    resources: HashMap<MockResource, ResourceEntry>,
    heaps: HashMap<MockHeap, HeapEntry>,
}

impl Inner {
    fn reserve_address(&mut self, size: u64) -> u64 {
        let address = self.next_address;
        self.next_address += aligned(size.max(1), DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT);
        address
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn host_memory(size: u64) -> Box<[u8]> {
    vec![0u8; size as usize].into_boxed_slice()
}

/// Device that keeps track of every object it creates.
/// CPU visible memory is backed by real host allocations.
pub(crate) struct MockDevice(Mutex<Inner>);

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.0.lock();
        fmt.debug_struct("MockDevice")
            .field("resources", &inner.resources.len())
            .field("heaps", &inner.heaps.len())
            .finish()
    }
}

impl MockDevice {
    pub(crate) fn new() -> Self {
        MockDevice(Mutex::new(Inner {
            next_id: 0,
            next_address: 0x1_0000_0000,
            resources: HashMap::new(),
            heaps: HashMap::new(),
        }))
    }

    /// Number of resources not destroyed yet.
    pub(crate) fn live_resources(&self) -> usize {
        self.0.lock().resources.len()
    }

    /// Number of heaps not destroyed yet.
    pub(crate) fn live_heaps(&self) -> usize {
        self.0.lock().heaps.len()
    }
}

impl Device for MockDevice {
    type Heap = MockHeap;
    type Resource = MockResource;

    fn create_heap(&self, desc: &HeapDesc) -> Result<MockHeap, OutOfMemory> {
        let mut inner = self.0.lock();
        let heap = MockHeap(inner.next_id());
        let gpu_address = inner.reserve_address(desc.size);
        let host = if desc.properties.heap_type.is_cpu_visible() {
            Some(host_memory(desc.size))
        } else {
            None
        };
        inner.heaps.insert(
            heap,
            HeapEntry {
                size: desc.size,
                gpu_address,
                host,
                placed: 0,
            },
        );
        Ok(heap)
    }

    fn create_committed_resource(
        &self,
        properties: &HeapProperties,
        desc: &ResourceDesc,
        _initial_state: ResourceState,
    ) -> Result<MockResource, OutOfMemory> {
        let size = self.resource_allocation_info(desc).size;
        let mut inner = self.0.lock();
        let resource = MockResource(inner.next_id());
        let gpu_address = inner.reserve_address(size);
        let host = if properties.heap_type.is_cpu_visible() {
            assert!(desc.is_buffer(), "Only buffers can be CPU visible");
            Host::Owned(host_memory(desc.width))
        } else {
            Host::None
        };
        inner.resources.insert(
            resource,
            ResourceEntry {
                dimension: desc.dimension,
                gpu_address,
                host,
                heap: None,
            },
        );
        Ok(resource)
    }

    fn create_placed_resource(
        &self,
        heap: &MockHeap,
        offset: u64,
        desc: &ResourceDesc,
        _initial_state: ResourceState,
    ) -> Result<MockResource, OutOfMemory> {
        let info = self.resource_allocation_info(desc);
        let mut inner = self.0.lock();
        let resource = MockResource(inner.next_id());
        let entry = match inner.heaps.get_mut(heap) {
            Some(entry) => entry,
            None => panic!("Heap {:?} is destroyed", heap),
        };
        assert_eq!(offset % info.alignment, 0, "Misplaced resource {:?}", desc);
        assert!(
            offset + info.size <= entry.size,
            "Resource {:?} at {} overflows heap of {} bytes",
            desc,
            offset,
            entry.size
        );
        entry.placed += 1;

        let gpu_address = entry.gpu_address + offset;
        let host = match &mut entry.host {
            Some(host) => Host::Placed(host.as_mut_ptr() as usize + offset as usize),
            None => Host::None,
        };
        inner.resources.insert(
            resource,
            ResourceEntry {
                dimension: desc.dimension,
                gpu_address,
                host,
                heap: Some(*heap),
            },
        );
        Ok(resource)
    }

    fn resource_allocation_info(&self, desc: &ResourceDesc) -> AllocationInfo {
        if desc.is_buffer() {
            return AllocationInfo {
                size: aligned(desc.width.max(1), DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT),
                alignment: DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
            };
        }

        let mut width = desc.width.max(1);
        let mut height = u64::from(desc.height.max(1));
        let mut size = 0;
        for _ in 0..desc.mip_levels.max(1) {
            size += width * height * 4;
            width = (width / 2).max(1);
            height = (height / 2).max(1);
        }
        size *= u64::from(desc.depth_or_array_size.max(1));

        let alignment = if size <= DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT && !desc.is_rt_or_ds() {
            SMALL_RESOURCE_PLACEMENT_ALIGNMENT
        } else {
            DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT
        };
        AllocationInfo {
            size: aligned(size, alignment),
            alignment,
        }
    }

    fn gpu_virtual_address(&self, resource: &MockResource) -> u64 {
        let inner = self.0.lock();
        match inner.resources.get(resource) {
            Some(entry) if entry.dimension == ResourceDimension::Buffer => entry.gpu_address,
            Some(_) => 0,
            None => panic!("Resource {:?} is destroyed", resource),
        }
    }

    unsafe fn map(&self, resource: &MockResource) -> Result<NonNull<u8>, MappingError> {
        let mut inner = self.0.lock();
        let entry = match inner.resources.get_mut(resource) {
            Some(entry) => entry,
            None => panic!("Resource {:?} is destroyed", resource),
        };
        let ptr = match &mut entry.host {
            Host::None => return Err(MappingError::HostInvisible),
            Host::Owned(host) => host.as_mut_ptr(),
            Host::Placed(address) => *address as *mut u8,
        };
        NonNull::new(ptr).ok_or(MappingError::MappingFailed)
    }

    unsafe fn destroy_resource(&self, resource: MockResource) {
        let mut inner = self.0.lock();
        let entry = match inner.resources.remove(&resource) {
            Some(entry) => entry,
            None => panic!("Double-free of {:?}", resource),
        };
        if let Some(heap) = entry.heap {
            match inner.heaps.get_mut(&heap) {
                Some(heap) => heap.placed -= 1,
                None => panic!("Resource {:?} outlived its heap", resource),
            }
        }
    }

    unsafe fn destroy_heap(&self, heap: MockHeap) {
        let mut inner = self.0.lock();
        let entry = match inner.heaps.remove(&heap) {
            Some(entry) => entry,
            None => panic!("Double-free of {:?}", heap),
        };
        assert_eq!(
            entry.placed, 0,
            "Heap {:?} destroyed with {} placed resources",
            heap, entry.placed
        );
    }
}
