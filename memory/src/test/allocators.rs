use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use {
    rand::{rngs::StdRng, Rng, SeedableRng},
    subheap_core::{Fence, HeapType, ResourceDesc, ResourceFlags, ResourceState},
};

use crate::{
    allocator::{BuddyAllocator, BuddyConfig},
    allocators::{Allocators, AllocatorsConfig, PoolStrategy},
    location::{LocationKind, ResourceLocation},
    test::{retire_frame, MockDevice},
};

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

type Location = ResourceLocation<MockDevice>;

fn fill(location: &Location, tag: u8) {
    if let Some(ptr) = location.mapped_base_address() {
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), tag, location.size() as usize);
        }
    }
}

fn check(location: &Location, tag: u8) {
    if let Some(ptr) = location.mapped_base_address() {
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), location.size() as usize) };
        assert!(
            bytes.iter().all(|&byte| byte == tag),
            "Memory of {:?} was overwritten",
            location
        );
    }
}

/// Buffers of live locations must not share GPU addresses.
fn assert_disjoint<'a>(locations: impl IntoIterator<Item = &'a Location>) {
    let mut ranges: Vec<_> = locations
        .into_iter()
        .filter(|location| location.gpu_virtual_address() != 0)
        .map(|location| {
            let start = location.gpu_virtual_address();
            start..start + location.size()
        })
        .collect();
    ranges.sort_by_key(|range| range.start);
    for pair in ranges.windows(2) {
        assert!(
            pair[0].end <= pair[1].start,
            "{:x?} overlaps {:x?}",
            pair[0],
            pair[1]
        );
    }
}

fn allocators(strategy: PoolStrategy) -> (Allocators<MockDevice>, Arc<MockDevice>, Arc<Fence>) {
    let device = Arc::new(MockDevice::new());
    let fence = Arc::new(Fence::new());
    let allocators = Allocators::new(
        device.clone(),
        fence.clone(),
        AllocatorsConfig {
            pool_strategy: strategy,
            ..AllocatorsConfig::default()
        },
    );
    (allocators, device, fence)
}

#[test]
fn random_buddy_allocations_never_overlap() {
    let device = Arc::new(MockDevice::new());
    let fence = Arc::new(Fence::new());
    let allocator = Arc::new(BuddyAllocator::new(
        device.clone(),
        fence.clone(),
        BuddyConfig {
            min_block_size: 256,
            max_block_size: 256 * KB,
            ..BuddyConfig::default()
        },
    ));
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live: Vec<(Location, u8)> = Vec::new();

    for _ in 0..2000 {
        if rng.gen_bool(0.6) {
            let size = rng.gen_range(1..=16 * KB);
            let alignment = [1, 16, 256, 512, 4 * KB][rng.gen_range(0..5)];
            let mut location = Location::new();
            if allocator.try_allocate(size, alignment, &mut location) {
                assert_eq!(location.offset_from_base() % alignment, 0);
                let tag = rng.gen();
                fill(&location, tag);
                live.push((location, tag));
            }
        } else if !live.is_empty() {
            let index = rng.gen_range(0..live.len());
            let (location, tag) = live.swap_remove(index);
            check(&location, tag);
        }

        if rng.gen_bool(0.1) {
            retire_frame(&fence);
            allocator.clean_up_allocations();
        } else if rng.gen_bool(0.1) {
            fence.advance();
        }

        assert_disjoint(live.iter().map(|(location, _)| location));
    }

    for (location, tag) in &live {
        check(location, *tag);
    }
    live.clear();
    retire_frame(&fence);
    allocator.clean_up_allocations();

    assert!(allocator.is_empty());
    assert_eq!(allocator.free_blocks(), vec![0..256 * KB]);
    allocator.release_all_resources();
    assert_eq!(device.live_resources(), 0);
}

fn random_frames(strategy: PoolStrategy, seed: u64) {
    let (allocators, device, fence) = allocators(strategy);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<(Location, u8)> = Vec::new();

    for _ in 0..64 {
        for _ in 0..rng.gen_range(1..32) {
            let mut location = Location::new();
            match rng.gen_range(0..5) {
                0 => {
                    let size = rng.gen_range(1..=96 * KB);
                    let alignment = [1, 4, 16, 256, 512][rng.gen_range(0..5)];
                    allocators.alloc_upload_resource(size, alignment, &mut location);
                    assert_eq!(location.gpu_virtual_address() % alignment, 0);
                }
                1 => {
                    let (flags, state) = if rng.gen_bool(0.3) {
                        (
                            ResourceFlags::ALLOW_UNORDERED_ACCESS,
                            ResourceState::UnorderedAccess,
                        )
                    } else {
                        (ResourceFlags::empty(), ResourceState::Common)
                    };
                    let desc = ResourceDesc::buffer(rng.gen_range(1..=256 * KB), flags);
                    allocators.alloc_default_resource(&desc, state, 256, &mut location);
                }
                2 => {
                    let flags = if rng.gen_bool(0.1) {
                        ResourceFlags::ALLOW_RENDER_TARGET
                    } else {
                        ResourceFlags::empty()
                    };
                    let desc = ResourceDesc::texture_2d(
                        rng.gen_range(1..=128),
                        rng.gen_range(1..=128),
                        0,
                        rng.gen_range(1..=4),
                        flags,
                    );
                    allocators.allocate_texture(&desc, ResourceState::Common, &mut location);
                }
                3 => {
                    let size = rng.gen_range(1..=80 * KB);
                    let alignment = [1, 16, 256][rng.gen_range(0..3)];
                    allocators
                        .fast_allocator()
                        .allocate(size, alignment, &mut location);
                }
                _ => {
                    // Constant memory is valid until the fence moves, it's not tracked.
                    allocators
                        .constant_allocator()
                        .allocate(rng.gen_range(1..=2 * KB), &mut location);
                    continue;
                }
            }

            assert!(location.is_valid());
            let tag = rng.gen();
            fill(&location, tag);
            live.push((location, tag));
        }

        assert_disjoint(live.iter().map(|(location, _)| location));
        for (location, tag) in &live {
            check(location, *tag);
        }

        let mut index = 0;
        while index < live.len() {
            if rng.gen_bool(0.5) {
                live.swap_remove(index);
            } else {
                index += 1;
            }
        }

        // GPU runs two frames behind.
        let submitted = fence.advance();
        if submitted > 2 {
            fence.signal_completed(submitted - 2);
        }
        allocators.clean_up_allocations();
    }

    live.clear();
    for _ in 0..32 {
        retire_frame(&fence);
        allocators.clean_up_allocations();
    }
    assert_eq!(allocators.deletion_queue().pending_count(), 0);

    allocators.dispose();
    assert_eq!(device.live_resources(), 0);
    assert_eq!(device.live_heaps(), 0);
}

#[test]
fn random_frames_with_multi_buddy_upload_pool() {
    random_frames(PoolStrategy::MultiBuddy, 1);
    random_frames(PoolStrategy::MultiBuddy, 2);
}

#[test]
fn random_frames_with_bucket_upload_pool() {
    random_frames(PoolStrategy::Bucket, 3);
    random_frames(PoolStrategy::Bucket, 4);
}

fn concurrent_frames(strategy: PoolStrategy, seed: u64) {
    let (allocators, device, fence) = allocators(strategy);
    let allocators = Arc::new(allocators);
    let done = Arc::new(AtomicBool::new(false));

    // GPU runs two frames behind the frames submitted here.
    let cleaner = {
        let allocators = allocators.clone();
        let fence = fence.clone();
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                let submitted = fence.advance();
                if submitted > 2 {
                    fence.signal_completed(submitted - 2);
                }
                allocators.clean_up_allocations();
                thread::yield_now();
            }
        })
    };

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let allocators = allocators.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed * 16 + worker);
                let mut live: Vec<(Location, u8)> = Vec::new();

                for _ in 0..1500 {
                    if live.len() < 48 && rng.gen_bool(0.6) {
                        let mut location = Location::new();
                        match rng.gen_range(0..4) {
                            0 => {
                                let size = rng.gen_range(1..=96 * KB);
                                let alignment = [1, 16, 256, 512][rng.gen_range(0..4)];
                                allocators.alloc_upload_resource(size, alignment, &mut location);
                            }
                            1 => {
                                let desc = ResourceDesc::buffer(
                                    rng.gen_range(1..=96 * KB),
                                    ResourceFlags::empty(),
                                );
                                allocators.alloc_default_resource(
                                    &desc,
                                    ResourceState::Common,
                                    256,
                                    &mut location,
                                );
                            }
                            2 => {
                                let desc = ResourceDesc::buffer(
                                    rng.gen_range(1..=96 * KB),
                                    ResourceFlags::ALLOW_UNORDERED_ACCESS,
                                );
                                allocators.alloc_default_resource(
                                    &desc,
                                    ResourceState::UnorderedAccess,
                                    256,
                                    &mut location,
                                );
                            }
                            _ => {
                                let size = rng.gen_range(1..=80 * KB);
                                let alignment = [1, 16, 256][rng.gen_range(0..3)];
                                allocators
                                    .fast_allocator()
                                    .allocate(size, alignment, &mut location);
                            }
                        }

                        assert!(location.is_valid());
                        let tag = rng.gen();
                        fill(&location, tag);
                        live.push((location, tag));
                    } else if !live.is_empty() {
                        let index = rng.gen_range(0..live.len());
                        let (location, tag) = live.swap_remove(index);
                        check(&location, tag);
                    }
                }

                for (location, tag) in &live {
                    check(location, *tag);
                }
                assert_disjoint(live.iter().map(|(location, _)| location));
            })
        })
        .collect();

    for worker in workers {
        if let Err(panic) = worker.join() {
            std::panic::resume_unwind(panic);
        }
    }
    done.store(true, Ordering::Release);
    if let Err(panic) = cleaner.join() {
        std::panic::resume_unwind(panic);
    }

    for _ in 0..32 {
        retire_frame(&fence);
        allocators.clean_up_allocations();
    }
    assert_eq!(allocators.deletion_queue().pending_count(), 0);

    let allocators = match Arc::try_unwrap(allocators) {
        Ok(allocators) => allocators,
        Err(_) => panic!("Allocators are still shared"),
    };
    allocators.dispose();
    assert_eq!(device.live_resources(), 0);
    assert_eq!(device.live_heaps(), 0);
}

#[test]
fn concurrent_frames_with_multi_buddy_upload_pool() {
    concurrent_frames(PoolStrategy::MultiBuddy, 5);
}

#[test]
fn concurrent_frames_with_bucket_upload_pool() {
    concurrent_frames(PoolStrategy::Bucket, 6);
}

#[test]
#[should_panic(expected = "power of two")]
fn odd_upload_alignment_is_rejected_by_multi_buddy_pool() {
    let (allocators, _device, _fence) = allocators(PoolStrategy::MultiBuddy);
    let mut location = Location::new();
    allocators.alloc_upload_resource(100, 12, &mut location);
}

#[test]
#[should_panic(expected = "power of two")]
fn odd_upload_alignment_is_rejected_by_bucket_pool() {
    let (allocators, _device, _fence) = allocators(PoolStrategy::Bucket);
    let mut location = Location::new();
    allocators.alloc_upload_resource(100, 12, &mut location);
}

#[test]
#[should_panic(expected = "power of two")]
fn oversized_default_alignment_is_rejected() {
    let (allocators, _device, _fence) = allocators(PoolStrategy::MultiBuddy);
    let mut location = Location::new();
    allocators.alloc_default_resource(
        &ResourceDesc::buffer(100, ResourceFlags::empty()),
        ResourceState::Common,
        128 * KB,
        &mut location,
    );
}

#[test]
fn small_upload_buffers_are_pooled() {
    let (allocators, device, _fence) = allocators(PoolStrategy::MultiBuddy);
    let mut first = Location::new();
    let mut second = Location::new();
    allocators.alloc_upload_resource(1000, 256, &mut first);
    allocators.alloc_upload_resource(1000, 256, &mut second);

    assert_eq!(first.kind(), LocationKind::SubAllocation);
    assert_eq!(first.resource(), second.resource());
    assert_eq!(device.live_resources(), 1);

    let mut large = Location::new();
    allocators.alloc_upload_resource(8 * MB, 256, &mut large);
    assert_eq!(large.kind(), LocationKind::StandAlone);
    assert_eq!(large.offset_from_base(), 0);

    drop((first, second, large));
    allocators.dispose();
    assert_eq!(device.live_resources(), 0);
}

#[test]
fn default_buffers_follow_placement_heuristic() {
    let (allocators, device, _fence) = allocators(PoolStrategy::MultiBuddy);

    let mut read_only = Location::new();
    allocators.alloc_default_resource(
        &ResourceDesc::buffer(3000, ResourceFlags::empty()),
        ResourceState::Common,
        256,
        &mut read_only,
    );
    assert_eq!(read_only.kind(), LocationKind::SubAllocation);
    assert!(read_only.mapped_base_address().is_none());

    let mut writable = Location::new();
    allocators.alloc_default_resource(
        &ResourceDesc::buffer(3000, ResourceFlags::ALLOW_UNORDERED_ACCESS),
        ResourceState::UnorderedAccess,
        256,
        &mut writable,
    );
    assert_eq!(writable.kind(), LocationKind::SubAllocation);
    assert_ne!(writable.resource(), read_only.resource());
    assert_eq!(writable.offset_from_base(), 0);
    assert_eq!(writable.size(), 3000);

    // Multiple of the placement alignment.
    let mut aligned = Location::new();
    allocators.alloc_default_resource(
        &ResourceDesc::buffer(128 * KB, ResourceFlags::empty()),
        ResourceState::Common,
        256,
        &mut aligned,
    );
    assert_eq!(aligned.kind(), LocationKind::StandAlone);

    // Pooled buffers share the pool state.
    let mut copy_target = Location::new();
    allocators.alloc_default_resource(
        &ResourceDesc::buffer(3000, ResourceFlags::empty()),
        ResourceState::CopyDest,
        256,
        &mut copy_target,
    );
    assert_eq!(copy_target.kind(), LocationKind::StandAlone);

    drop((read_only, writable, aligned, copy_target));
    allocators.dispose();
    assert_eq!(device.live_resources(), 0);
    assert_eq!(device.live_heaps(), 0);
}

#[test]
fn render_targets_are_never_pooled() {
    let (allocators, device, _fence) = allocators(PoolStrategy::MultiBuddy);

    let mut small = Location::new();
    allocators.allocate_texture(
        &ResourceDesc::texture_2d(32, 32, 0, 1, ResourceFlags::empty()),
        ResourceState::Common,
        &mut small,
    );
    assert_eq!(small.kind(), LocationKind::SubAllocation);
    assert_eq!(small.size(), 4 * KB);
    assert_eq!(small.gpu_virtual_address(), 0);

    let mut target = Location::new();
    allocators.allocate_texture(
        &ResourceDesc::texture_2d(32, 32, 0, 1, ResourceFlags::ALLOW_RENDER_TARGET),
        ResourceState::RenderTarget,
        &mut target,
    );
    assert_eq!(target.kind(), LocationKind::StandAlone);

    let mut large = Location::new();
    allocators.allocate_texture(
        &ResourceDesc::texture_2d(512, 512, 0, 1, ResourceFlags::empty()),
        ResourceState::Common,
        &mut large,
    );
    assert_eq!(large.kind(), LocationKind::StandAlone);

    drop((small, target, large));
    allocators.dispose();
    assert_eq!(device.live_resources(), 0);
    assert_eq!(device.live_heaps(), 0);
}

#[test]
fn stand_alone_resources_wait_for_fence() {
    let (allocators, device, fence) = allocators(PoolStrategy::MultiBuddy);
    let mut location = Location::new();
    allocators.alloc_upload_resource(16 * MB, 256, &mut location);
    assert_eq!(location.kind(), LocationKind::StandAlone);

    location.clear();
    assert_eq!(device.live_resources(), 1);
    allocators.clean_up_allocations();
    assert_eq!(device.live_resources(), 1);

    retire_frame(&fence);
    allocators.clean_up_allocations();
    assert_eq!(device.live_resources(), 0);

    allocators.dispose();
}

#[test]
fn utilization_lists_every_allocator() {
    let (allocators, _device, _fence) = allocators(PoolStrategy::MultiBuddy);
    let mut location = Location::new();
    allocators.alloc_upload_resource(4 * KB, 256, &mut location);

    let utilization = allocators.utilization();
    assert_eq!(utilization.allocators.len(), 6);
    assert_eq!(utilization.allocators[0].1.heap_type, HeapType::Upload);
    assert_eq!(utilization.reserved(), 4 * MB);
    assert_eq!(utilization.used(), 4 * KB);
    assert!(utilization.to_string().contains("upload"));

    location.clear();
    allocators.dispose();
}

#[test]
fn transfer_ownership_moves_allocation() {
    let (allocators, device, fence) = allocators(PoolStrategy::MultiBuddy);
    let mut source = Location::new();
    let mut target = Location::new();
    allocators.alloc_upload_resource(512, 256, &mut source);
    allocators.alloc_upload_resource(16 * MB, 256, &mut target);
    let resource = source.resource().cloned();

    target.transfer_ownership(&mut source);
    assert!(!source.is_valid());
    assert_eq!(target.resource().cloned(), resource);
    assert_eq!(target.size(), 512);

    // Stand-alone buffer that `target` held is on its way out.
    retire_frame(&fence);
    allocators.clean_up_allocations();
    assert_eq!(device.live_resources(), 1);

    drop(target);
    allocators.dispose();
    assert_eq!(device.live_resources(), 0);
}
