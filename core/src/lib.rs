//! Graphics API boundary used by the `subheap` allocators.
//!
//! Backends implement [`Device`] for their native device and feed GPU completion
//! into a [`Fence`]. Everything above this crate only talks to these two.

#![warn(
    missing_debug_implementations,
    missing_copy_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

#[macro_use]
mod slow;
mod device;
mod error;
mod fence;

pub use crate::{device::*, error::*, fence::*};
