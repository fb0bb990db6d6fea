//! GPU memory sub-allocation.
//!
//! A handful of large heaps and buffers are carved into many logical allocations
//! described by [`ResourceLocation`]. Freed memory is held back until the GPU
//! timeline tracked by [`Fence`] confirms it is no longer referenced.

#![warn(
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

#[macro_use]
extern crate subheap_core;

mod allocator;
mod allocators;
mod deletion;
mod heap;
mod location;
mod util;
mod utilization;

#[cfg(test)]
mod test;

pub use crate::{
    allocator::{
        AllocationStrategy, BucketAllocator, BucketBlock, BucketConfig, BuddyAllocator,
        BuddyBlock, BuddyConfig, ConstantConfig, FastAllocator, FastConfig,
        FastConstantAllocator, FastPage, FastPagePool, MultiBuddyAllocator, RingBuffer,
    },
    allocators::{Allocators, AllocatorsConfig, PoolStrategy},
    deletion::{DeferredDeletionQueue, DeletionSender, Garbage},
    heap::SharedHeap,
    location::{LocationKind, ResourceLocation},
    utilization::{AllocatorStats, Kind, TotalUtilization},
};

pub use subheap_core::{
    AllocationInfo, Device, Fence, HeapDesc, HeapFlags, HeapProperties, HeapType, MappingError,
    OutOfMemory, ResourceDesc, ResourceDimension, ResourceFlags, ResourceState,
};
