use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use {
    parking_lot::Mutex,
    smallvec::SmallVec,
    subheap_core::{
        Device, Fence, HeapProperties, HeapType, ResourceDesc, ResourceFlags,
        DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
    },
};

use crate::{
    allocator::{allocate_stand_alone, heap_initial_state, BackingBuffer},
    deletion::DeletionSender,
    location::ResourceLocation,
    util::aligned,
    utilization::{AllocatorStats, Kind},
};

/// Config for `FastAllocator` and its page pool.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FastConfig {
    /// Memory pool of the pages.
    pub heap_type: HeapType,

    /// Size of one page.
    pub page_size: u64,

    /// Idle pages are destroyed after this many completed fence values.
    pub frame_lag: u64,

    /// Nodes that can see the memory.
    pub visibility_mask: u32,
}

impl Default for FastConfig {
    fn default() -> Self {
        FastConfig {
            heap_type: HeapType::Upload,
            page_size: 64 * 1024,
            frame_lag: 20,
            visibility_mask: 1,
        }
    }
}

/// Page of `FastPagePool`.
/// Every location allocated from the page holds a reference to it.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct FastPage<D: Device> {
    buffer: BackingBuffer<D>,

    /// Fence value the page was returned to the pool with.
    fence_value: AtomicU64,
}

impl<D> FastPage<D>
where
    D: Device,
{
    /// Size of the page.
    pub fn size(&self) -> u64 {
        self.buffer.size()
    }
}

/// Pool of equally sized pages.
///
/// Page returned to the pool is handed out again once the GPU reaches
/// the fence value it was returned with and nobody else holds it.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct FastPagePool<D: Device> {
    #[derivative(Debug = "ignore")]
    device: Arc<D>,
    fence: Arc<Fence>,
    config: FastConfig,
    pages: Mutex<Vec<Arc<FastPage<D>>>>,

    /// Pages created and not destroyed yet, pooled or handed out.
    live: AtomicU64,
}

impl<D> FastPagePool<D>
where
    D: Device,
{
    /// Create new pool.
    pub fn new(device: Arc<D>, fence: Arc<Fence>, config: FastConfig) -> Self {
        log::info!("Create new fast page pool: {:#?}", config);
        FastPagePool {
            device,
            fence,
            config,
            pages: Mutex::new(Vec::new()),
            live: AtomicU64::new(0),
        }
    }

    /// Size of pages in this pool.
    pub fn page_size(&self) -> u64 {
        self.config.page_size
    }

    /// Memory pool of the pages.
    pub fn heap_type(&self) -> HeapType {
        self.config.heap_type
    }

    /// Number of pages waiting in the pool.
    pub fn pooled_pages(&self) -> usize {
        self.pages.lock().len()
    }

    fn properties(&self) -> HeapProperties {
        HeapProperties {
            heap_type: self.config.heap_type,
            visibility_mask: self.config.visibility_mask,
        }
    }

    /// Take reusable page from the pool or create new one.
    pub fn request_page(&self) -> Arc<FastPage<D>> {
        let mut pages = self.pages.lock();
        let reusable = pages.iter().position(|page| {
            Arc::strong_count(page) == 1 && self.fence.is_complete(page.fence_value.load(Ordering::Acquire))
        });

        if let Some(index) = reusable {
            return pages.swap_remove(index);
        }
        drop(pages);

        let buffer = BackingBuffer::create(
            &*self.device,
            self.properties(),
            self.config.page_size,
            ResourceFlags::empty(),
            heap_initial_state(self.config.heap_type),
        );
        let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("Fast page created, {} pages alive", live);

        Arc::new(FastPage {
            buffer,
            fence_value: AtomicU64::new(0),
        })
    }

    /// Return page to the pool, tagged with the current fence value.
    pub fn return_page(&self, page: Arc<FastPage<D>>) {
        page.fence_value
            .store(self.fence.current_value(), Ordering::Release);
        self.pages.lock().push(page);
    }

    /// Destroy idle pages returned at least `frame_lag` completed values ago.
    pub fn clean_up_pages(&self, frame_lag: u64) {
        let completed = self.fence.last_completed_value();
        let mut pages = self.pages.lock();

        let mut index = 0;
        let mut destroyed = 0;
        while index < pages.len() {
            let page = &pages[index];
            let idle = Arc::strong_count(page) == 1
                && page.fence_value.load(Ordering::Acquire) + frame_lag <= completed;
            if idle {
                self.destroy_page(pages.swap_remove(index));
                destroyed += 1;
            } else {
                index += 1;
            }
        }

        if destroyed > 0 {
            log::debug!("Destroyed {} idle fast pages", destroyed);
        }
    }

    fn destroy_page(&self, page: Arc<FastPage<D>>) {
        match Arc::try_unwrap(page) {
            Ok(page) => {
                unsafe {
                    self.device.destroy_resource(page.buffer.into_resource());
                }
                self.live.fetch_sub(1, Ordering::Relaxed);
            }
            Err(page) => log::error!("Fast page {:?} is still in use. It leaks", page),
        }
    }

    /// Destroy every page in the pool.
    ///
    /// GPU must not use any page.
    pub fn destroy(&self) {
        let pages: SmallVec<[_; 16]> = self.pages.lock().drain(..).collect();
        for page in pages {
            self.destroy_page(page);
        }
    }

    /// Number of pages not destroyed yet, pooled or handed out.
    pub fn live_pages(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    /// Collect pool stats.
    /// Pages handed out count as used, pooled ones as free.
    pub fn stats(&self) -> AllocatorStats {
        let pages = self.pages.lock();
        let live = self.live.load(Ordering::Relaxed);
        let pooled = (pages.len() as u64).min(live);
        AllocatorStats {
            kind: Kind::Fast,
            heap_type: self.config.heap_type,
            reserved: live * self.config.page_size,
            used: (live - pooled) * self.config.page_size,
            backing_objects: live,
            failed_allocations: 0,
        }
    }
}

impl<D> Drop for FastPagePool<D>
where
    D: Device,
{
    fn drop(&mut self) {
        let pages = self.pages.get_mut();
        if !pages.is_empty() {
            log::error!("Fast page pool dropped with {} pages", pages.len());
        }
    }
}

#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
struct FastState<D: Device> {
    current: Option<Arc<FastPage<D>>>,
    offset: u64,
}

/// Linear allocator for data that lives for one frame.
///
/// Allocations bump an offset within the current page.
/// Full page goes back to the pool and memory is reclaimed one page at a time.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct FastAllocator<D: Device> {
    pool: Arc<FastPagePool<D>>,
    deletion: DeletionSender<D>,
    state: Mutex<FastState<D>>,
}

impl<D> FastAllocator<D>
where
    D: Device,
{
    /// Create new allocator over `pool`.
    pub fn new(pool: Arc<FastPagePool<D>>, deletion: DeletionSender<D>) -> Self {
        FastAllocator {
            pool,
            deletion,
            state: Mutex::new(FastState {
                current: None,
                offset: 0,
            }),
        }
    }

    /// Pool pages are taken from.
    pub fn pool(&self) -> &Arc<FastPagePool<D>> {
        &self.pool
    }

    /// Allocate `size` bytes aligned to `alignment`.
    /// Requests larger than a page get their own stand-alone buffer.
    ///
    /// Returns CPU address of the allocation if pages are CPU visible.
    pub fn allocate(
        &self,
        size: u64,
        alignment: u64,
        location: &mut ResourceLocation<D>,
    ) -> Option<NonNull<u8>> {
        let alignment = alignment.max(1);
        assert!(
            alignment.is_power_of_two() && alignment <= DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
            "Fast allocator alignment {} is not power of two up to page alignment",
            alignment
        );
        let page_size = self.pool.page_size();

        if size > page_size {
            log::debug!("Fast allocation of {} bytes doesn't fit a page", size);
            allocate_stand_alone(
                &*self.pool.device,
                self.pool.properties(),
                &ResourceDesc::buffer(size, ResourceFlags::empty()),
                heap_initial_state(self.pool.heap_type()),
                self.deletion.clone(),
                location,
            );
            return location.mapped_base_address();
        }

        let mut state = self.state.lock();
        let fits = state.current.is_some() && aligned(state.offset, alignment) + size <= page_size;
        if !fits {
            if let Some(page) = state.current.take() {
                self.pool.return_page(page);
            }
            state.current = Some(self.pool.request_page());
            state.offset = 0;
        }

        let page = match &state.current {
            Some(page) => page.clone(),
            None => unreachable!(),
        };
        let offset = aligned(state.offset, alignment);
        state.offset = offset + size;
        drop(state);

        let (gpu_address, mapped) = page.buffer.address(offset);
        let resource = page.buffer.resource_handle();
        log::trace!("Fast allocation of {} bytes at {}", size, offset);
        location.as_fast_allocation(Some(page), resource, offset, size, gpu_address, mapped);
        mapped
    }

    /// Return current page to the pool.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        if let Some(page) = state.current.take() {
            self.pool.return_page(page);
        }
        state.offset = 0;
    }
}

impl<D> Drop for FastAllocator<D>
where
    D: Device,
{
    fn drop(&mut self) {
        if let Some(page) = self.state.get_mut().current.take() {
            self.pool.return_page(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deletion::DeferredDeletionQueue,
        location::LocationKind,
        test::{retire_frame, MockDevice},
    };

    const KB: u64 = 1024;

    struct Fixture {
        device: Arc<MockDevice>,
        fence: Arc<Fence>,
        queue: DeferredDeletionQueue<MockDevice>,
        pool: Arc<FastPagePool<MockDevice>>,
    }

    impl Fixture {
        fn new() -> Self {
            let device = Arc::new(MockDevice::new());
            let fence = Arc::new(Fence::new());
            let queue = DeferredDeletionQueue::new(device.clone(), fence.clone());
            let pool = Arc::new(FastPagePool::new(
                device.clone(),
                fence.clone(),
                FastConfig::default(),
            ));
            Fixture {
                device,
                fence,
                queue,
                pool,
            }
        }

        fn allocator(&self) -> FastAllocator<MockDevice> {
            FastAllocator::new(self.pool.clone(), self.queue.sender())
        }
    }

    #[test]
    fn allocations_bump_within_page() {
        let fixture = Fixture::new();
        let allocator = fixture.allocator();

        let mut first = ResourceLocation::new();
        let mut second = ResourceLocation::new();
        let ptr = allocator.allocate(100, 16, &mut first).unwrap();
        allocator.allocate(100, 256, &mut second);

        assert_eq!(first.kind(), LocationKind::FastAllocation);
        assert_eq!(first.offset_from_base(), 0);
        assert_eq!(second.offset_from_base(), 256);
        assert_eq!(first.resource(), second.resource());
        assert_eq!(Some(ptr), first.mapped_base_address());
        assert_eq!(
            second.gpu_virtual_address() - first.gpu_virtual_address(),
            256
        );

        drop(first);
        drop(second);
        allocator.destroy();
        fixture.pool.destroy();
        assert_eq!(fixture.device.live_resources(), 0);
    }

    #[test]
    fn page_is_reused_only_when_idle() {
        let fixture = Fixture::new();
        let allocator = fixture.allocator();

        let mut held = ResourceLocation::new();
        allocator.allocate(40 * KB, 256, &mut held);
        let first_page = held.resource().cloned();

        let mut second = ResourceLocation::new();
        allocator.allocate(40 * KB, 256, &mut second);
        assert_ne!(second.resource().cloned(), first_page);
        assert_eq!(fixture.pool.pooled_pages(), 1);
        drop(second);

        // First page is still held and its fence is incomplete.
        retire_frame(&fixture.fence);
        let mut third = ResourceLocation::new();
        allocator.allocate(40 * KB, 256, &mut third);
        assert_ne!(third.resource().cloned(), first_page);
        assert_eq!(fixture.device.live_resources(), 3);
        drop(third);

        held.clear();
        let mut fourth = ResourceLocation::new();
        allocator.allocate(40 * KB, 256, &mut fourth);
        assert_eq!(fourth.resource().cloned(), first_page);
        assert_eq!(fixture.device.live_resources(), 3);

        drop(fourth);
        allocator.destroy();
        fixture.pool.destroy();
        assert_eq!(fixture.device.live_resources(), 0);
    }

    #[test]
    fn large_request_is_stand_alone() {
        let fixture = Fixture::new();
        let allocator = fixture.allocator();

        let mut location = ResourceLocation::new();
        let ptr = allocator.allocate(100 * KB, 256, &mut location);
        assert!(ptr.is_some());
        assert_eq!(location.kind(), LocationKind::StandAlone);
        assert_eq!(location.size(), 100 * KB);
        assert_eq!(fixture.pool.pooled_pages(), 0);

        drop(location);
        assert_eq!(fixture.device.live_resources(), 1);
        retire_frame(&fixture.fence);
        assert_eq!(fixture.queue.release_resources(false), 1);
        assert_eq!(fixture.device.live_resources(), 0);
    }

    #[test]
    fn idle_pages_are_destroyed_after_lag() {
        let fixture = Fixture::new();
        let allocator = fixture.allocator();

        let mut location = ResourceLocation::new();
        allocator.allocate(KB, 256, &mut location);
        drop(location);
        allocator.destroy();
        assert_eq!(fixture.pool.pooled_pages(), 1);

        fixture.pool.clean_up_pages(2);
        assert_eq!(fixture.pool.pooled_pages(), 1);

        for _ in 0..2 {
            retire_frame(&fixture.fence);
        }
        fixture.pool.clean_up_pages(2);
        assert_eq!(fixture.pool.pooled_pages(), 1);

        retire_frame(&fixture.fence);
        fixture.pool.clean_up_pages(2);
        assert_eq!(fixture.pool.pooled_pages(), 0);
        assert_eq!(fixture.device.live_resources(), 0);
    }

    #[test]
    fn stats_count_live_pages() {
        let fixture = Fixture::new();
        let allocator = fixture.allocator();

        let mut first = ResourceLocation::new();
        let mut second = ResourceLocation::new();
        allocator.allocate(40 * KB, 256, &mut first);
        allocator.allocate(40 * KB, 256, &mut second);

        // One page is pooled, the other is current.
        let stats = fixture.pool.stats();
        assert_eq!(stats.backing_objects, 2);
        assert_eq!(stats.reserved, 128 * KB);
        assert_eq!(stats.used, 64 * KB);

        drop(first);
        drop(second);
        allocator.destroy();
        let stats = fixture.pool.stats();
        assert_eq!(stats.reserved, 128 * KB);
        assert_eq!(stats.used, 0);

        fixture.pool.destroy();
        let stats = fixture.pool.stats();
        assert_eq!(stats.backing_objects, 0);
        assert_eq!(stats.reserved, 0);
        assert_eq!(fixture.pool.live_pages(), 0);
    }

    #[test]
    #[should_panic(expected = "not power of two")]
    fn huge_alignment_is_rejected() {
        let fixture = Fixture::new();
        let allocator = fixture.allocator();
        let mut location = ResourceLocation::new();
        allocator.allocate(16, 128 * KB, &mut location);
    }

    #[test]
    #[should_panic(expected = "not power of two")]
    fn odd_alignment_is_rejected() {
        let fixture = Fixture::new();
        let allocator = fixture.allocator();
        let mut location = ResourceLocation::new();
        allocator.allocate(16, 48, &mut location);
    }
}
