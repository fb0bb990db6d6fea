use std::{fmt::Debug, ptr::NonNull};

use crate::error::{MappingError, OutOfMemory};

/// Alignment required for placing buffers and regular textures into a heap.
pub const DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT: u64 = 64 * 1024;

/// Alignment allowed for placing small textures into a heap.
pub const SMALL_RESOURCE_PLACEMENT_ALIGNMENT: u64 = 4 * 1024;

/// Alignment of texture data in upload buffers.
pub const TEXTURE_DATA_PLACEMENT_ALIGNMENT: u64 = 512;

/// Alignment of constant data views.
pub const CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT: u64 = 256;

/// Kind of memory pool a heap or committed resource is created in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HeapType {
    /// Device local memory, no CPU access.
    Default,

    /// CPU write, GPU read.
    Upload,

    /// GPU write, CPU read.
    Readback,
}

impl HeapType {
    /// Check if resources in this heap can be mapped.
    pub fn is_cpu_visible(&self) -> bool {
        match self {
            HeapType::Default => false,
            HeapType::Upload | HeapType::Readback => true,
        }
    }
}

bitflags::bitflags! {
    /// Restrictions on what a heap may contain.
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct HeapFlags: u32 {
        /// Heap may only hold buffers.
        const ALLOW_ONLY_BUFFERS = 0x1;

        /// Heap may only hold textures that are neither render targets nor depth stencils.
        const ALLOW_ONLY_NON_RT_DS_TEXTURES = 0x2;

        /// Heap may only hold render target and depth stencil textures.
        const ALLOW_ONLY_RT_DS_TEXTURES = 0x4;
    }
}

bitflags::bitflags! {
    /// Usage flags of a resource.
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ResourceFlags: u32 {
        /// Resource can be bound as render target.
        const ALLOW_RENDER_TARGET = 0x1;

        /// Resource can be bound as depth stencil.
        const ALLOW_DEPTH_STENCIL = 0x2;

        /// Resource can be written from shaders.
        const ALLOW_UNORDERED_ACCESS = 0x4;

        /// Resource can't be read from shaders.
        const DENY_SHADER_RESOURCE = 0x8;
    }
}

/// State a resource is in when created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResourceState {
    /// Common state. Required for resources shared between queues.
    Common,

    /// Readable by every stage. The only valid state for upload heaps.
    GenericRead,

    /// Destination of copy operations. The only valid state for readback heaps.
    CopyDest,

    /// Shader writable.
    UnorderedAccess,

    /// Render target.
    RenderTarget,

    /// Depth stencil attachment.
    DepthWrite,
}

/// Dimensionality of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResourceDimension {
    /// Linear buffer.
    Buffer,

    /// One dimensional texture.
    Texture1D,

    /// Two dimensional texture.
    Texture2D,

    /// Three dimensional texture.
    Texture3D,
}

/// Description of a resource to create.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceDesc {
    /// Resource dimensionality.
    pub dimension: ResourceDimension,

    /// Requested placement alignment. `0` lets the device pick.
    pub alignment: u64,

    /// Width in texels, or size in bytes for buffers.
    pub width: u64,

    /// Height in texels. `1` for buffers.
    pub height: u32,

    /// Depth of 3D textures or array size of other textures.
    pub depth_or_array_size: u16,

    /// Number of mip levels.
    pub mip_levels: u16,

    /// Opaque format identifier understood by the device.
    pub format: u32,

    /// Usage flags.
    pub flags: ResourceFlags,
}

impl ResourceDesc {
    /// Describe a buffer of `size` bytes.
    pub fn buffer(size: u64, flags: ResourceFlags) -> Self {
        ResourceDesc {
            dimension: ResourceDimension::Buffer,
            alignment: 0,
            width: size,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            format: 0,
            flags,
        }
    }

    /// Describe a 2D texture.
    pub fn texture_2d(
        width: u64,
        height: u32,
        format: u32,
        mip_levels: u16,
        flags: ResourceFlags,
    ) -> Self {
        ResourceDesc {
            dimension: ResourceDimension::Texture2D,
            alignment: 0,
            width,
            height,
            depth_or_array_size: 1,
            mip_levels,
            format,
            flags,
        }
    }

    /// Check if this describes a buffer.
    pub fn is_buffer(&self) -> bool {
        self.dimension == ResourceDimension::Buffer
    }

    /// Check if resource can be a render target or depth stencil.
    pub fn is_rt_or_ds(&self) -> bool {
        self.flags
            .intersects(ResourceFlags::ALLOW_RENDER_TARGET | ResourceFlags::ALLOW_DEPTH_STENCIL)
    }
}

/// Memory pool and node visibility for committed resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeapProperties {
    /// Memory pool.
    pub heap_type: HeapType,

    /// Opaque mask of nodes that can see the memory.
    pub visibility_mask: u32,
}

/// Description of a heap to create.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapDesc {
    /// Heap size in bytes.
    pub size: u64,

    /// Memory pool and node visibility.
    pub properties: HeapProperties,

    /// Heap alignment.
    pub alignment: u64,

    /// Restrictions on the heap content.
    pub flags: HeapFlags,
}

/// Size and alignment a resource occupies when placed into a heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocationInfo {
    /// Size in bytes.
    pub size: u64,

    /// Required alignment.
    pub alignment: u64,
}

/// Graphics device the allocators create their backing objects from.
///
/// Handles are expected to be cheap to clone, like native API handles.
/// Cloning a handle does not extend the lifetime of the object it refers to.
pub trait Device: Debug + Send + Sync + 'static {
    /// Heap handle.
    type Heap: Clone + Debug + Send + Sync + 'static;

    /// Resource handle.
    type Resource: Clone + Debug + Send + Sync + 'static;

    /// Create heap that placed resources can be created in.
    fn create_heap(&self, desc: &HeapDesc) -> Result<Self::Heap, OutOfMemory>;

    /// Create resource with its own implicit heap.
    fn create_committed_resource(
        &self,
        properties: &HeapProperties,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> Result<Self::Resource, OutOfMemory>;

    /// Create resource at `offset` inside `heap`.
    fn create_placed_resource(
        &self,
        heap: &Self::Heap,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> Result<Self::Resource, OutOfMemory>;

    /// Get size and alignment required to place resource into a heap.
    fn resource_allocation_info(&self, desc: &ResourceDesc) -> AllocationInfo;

    /// Get GPU virtual address of the first byte of a buffer resource.
    fn gpu_virtual_address(&self, resource: &Self::Resource) -> u64;

    /// Map whole resource persistently.
    ///
    /// # Safety
    ///
    /// Resource must be created by this device and not destroyed.
    unsafe fn map(&self, resource: &Self::Resource) -> Result<NonNull<u8>, MappingError>;

    /// Destroy resource.
    ///
    /// # Safety
    ///
    /// Resource must not be used by the GPU anymore.
    unsafe fn destroy_resource(&self, resource: Self::Resource);

    /// Destroy heap.
    ///
    /// # Safety
    ///
    /// Heap must not be used by the GPU anymore and every resource placed in it must be destroyed.
    unsafe fn destroy_heap(&self, heap: Self::Heap);
}
