/// Typical device error - out of available memory.
/// The allocators treat it as fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, failure::Fail)]
pub enum OutOfMemory {
    /// Host memory exhausted.
    #[fail(display = "Out of host memory")]
    Host,

    /// Device memory exhausted.
    #[fail(display = "Out of device memory")]
    Device,
}

/// Possible cause of mapping failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, failure::Fail)]
pub enum MappingError {
    /// Attempt to map resource that lives in memory without host access.
    #[fail(display = "Resource is not CPU visible and can't be mapped")]
    HostInvisible,

    /// Unable to allocate an appropriately sized contiguous virtual address range.
    #[fail(display = "Virtual memory allocation failed")]
    MappingFailed,

    /// Out of either host or device memory.
    #[fail(display = "{}", _0)]
    OutOfMemory(OutOfMemory),
}

impl From<OutOfMemory> for MappingError {
    fn from(error: OutOfMemory) -> Self {
        MappingError::OutOfMemory(error)
    }
}
