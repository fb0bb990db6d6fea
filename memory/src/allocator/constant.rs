use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use {
    parking_lot::Mutex,
    subheap_core::{
        Device, Fence, HeapProperties, HeapType, ResourceFlags, ResourceState,
        CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT,
    },
};

use crate::{
    allocator::{BackingBuffer, RingBuffer},
    deletion::{DeletionSender, Garbage},
    location::ResourceLocation,
    util::aligned,
    utilization::{AllocatorStats, Kind},
};

/// Config for `FastConstantAllocator`.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConstantConfig {
    /// Initial size of the ring buffer.
    pub page_size: u64,

    /// Placement granularity. Every allocation takes a multiple of it.
    pub alignment: u64,

    /// Nodes that can see the memory.
    pub visibility_mask: u32,
}

impl Default for ConstantConfig {
    fn default() -> Self {
        ConstantConfig {
            page_size: 64 * 1024,
            alignment: CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT,
            visibility_mask: 1,
        }
    }
}

#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
struct ConstantState<D: Device> {
    buffer: Option<BackingBuffer<D>>,
    ring: RingBuffer,
}

/// Ring buffer allocator for constant data.
///
/// Backed by one upload buffer that grows by half when the ring
/// can't fit a request next to data the GPU may still read.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct FastConstantAllocator<D: Device> {
    #[derivative(Debug = "ignore")]
    device: Arc<D>,
    fence: Arc<Fence>,
    deletion: DeletionSender<D>,
    config: ConstantConfig,
    state: Mutex<ConstantState<D>>,
    grow_count: AtomicU64,
}

impl<D> FastConstantAllocator<D>
where
    D: Device,
{
    /// Create new allocator. Buffer is created on first allocation.
    pub fn new(
        device: Arc<D>,
        fence: Arc<Fence>,
        deletion: DeletionSender<D>,
        config: ConstantConfig,
    ) -> Self {
        assert!(
            config.alignment.is_power_of_two(),
            "Constant alignment must be power of two"
        );
        assert_eq!(
            config.page_size % config.alignment,
            0,
            "Page size must be multiple of alignment"
        );
        log::info!("Create new constant allocator: {:#?}", config);

        FastConstantAllocator {
            device,
            fence,
            deletion,
            config,
            state: Mutex::new(ConstantState {
                buffer: None,
                ring: RingBuffer::new(config.page_size / config.alignment),
            }),
            grow_count: AtomicU64::new(0),
        }
    }

    /// Current size of the buffer in bytes.
    pub fn capacity(&self) -> u64 {
        self.state.lock().ring.capacity() * self.config.alignment
    }

    /// Number of times the buffer grew.
    pub fn grow_count(&self) -> u64 {
        self.grow_count.load(Ordering::Relaxed)
    }

    fn create_buffer(&self, size: u64) -> BackingBuffer<D> {
        BackingBuffer::create(
            &*self.device,
            HeapProperties {
                heap_type: HeapType::Upload,
                visibility_mask: self.config.visibility_mask,
            },
            size,
            ResourceFlags::empty(),
            ResourceState::GenericRead,
        )
    }

    /// Allocate `bytes` of constant data.
    /// Returns CPU address to write the data to.
    pub fn allocate(&self, bytes: u64, location: &mut ResourceLocation<D>) -> NonNull<u8> {
        let size = aligned(bytes.max(1), self.config.alignment);
        let units = size / self.config.alignment;

        let mut state = self.state.lock();
        if state.buffer.is_none() {
            let capacity = state.ring.capacity() * self.config.alignment;
            state.buffer = Some(self.create_buffer(capacity));
        }

        let offset = match state.ring.allocate(units, &self.fence) {
            Some(offset) => offset,
            None => {
                self.grow(&mut state, size);
                match state.ring.allocate(units, &self.fence) {
                    Some(offset) => offset,
                    None => panic!("Grown constant buffer can't fit {} bytes", size),
                }
            }
        };

        let offset = offset * self.config.alignment;
        let (resource, gpu_address, mapped) = match &state.buffer {
            Some(buffer) => {
                let (gpu_address, mapped) = buffer.address(offset);
                (buffer.resource_handle(), gpu_address, mapped)
            }
            None => unreachable!(),
        };
        drop(state);

        let mapped = match mapped {
            Some(mapped) => mapped,
            None => unreachable!("Upload buffers are always mapped"),
        };

        log::trace!("Constant allocation of {} bytes at {}", bytes, offset);
        location.as_fast_allocation(None, resource, offset, bytes, gpu_address, Some(mapped));
        mapped
    }

    /// Replace buffer with one that is at least half as large again and can fit `size` bytes.
    /// Old buffer is destroyed once GPU work submitted so far is complete.
    fn grow(&self, state: &mut ConstantState<D>, size: u64) {
        let old = state.ring.capacity() * self.config.alignment;
        let new = aligned((old * 3 / 2).max(size), self.config.alignment);
        log::warn!("Constant buffer grows from {} to {} bytes", old, new);

        if let Some(buffer) = state.buffer.replace(self.create_buffer(new)) {
            self.deletion
                .defer(Garbage::Resource(buffer.into_resource()));
        }
        state.ring.reset(new / self.config.alignment);
        self.grow_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Collect allocator stats.
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        let has_buffer = state.buffer.is_some();
        AllocatorStats {
            kind: Kind::Constant,
            heap_type: HeapType::Upload,
            reserved: if has_buffer {
                state.ring.capacity() * self.config.alignment
            } else {
                0
            },
            used: state.ring.used() * self.config.alignment,
            backing_objects: has_buffer as u64,
            failed_allocations: 0,
        }
    }

    /// Release the buffer through the deletion queue.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        if let Some(buffer) = state.buffer.take() {
            self.deletion
                .defer(Garbage::Resource(buffer.into_resource()));
        }
        let capacity = state.ring.capacity();
        state.ring.reset(capacity);
    }
}

impl<D> Drop for FastConstantAllocator<D>
where
    D: Device,
{
    fn drop(&mut self) {
        self.destroy();
    }
}
