use {
    colorful::{core::color_string::CString, Color, Colorful as _},
    subheap_core::HeapType,
};

/// Kind of allocator stats were collected from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Single `BuddyAllocator`.
    Buddy,

    /// `MultiBuddyAllocator`.
    MultiBuddy,

    /// `BucketAllocator`.
    Bucket,

    /// `FastPagePool`.
    Fast,

    /// `FastConstantAllocator`.
    Constant,
}

/// Stats of one allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Allocator kind.
    pub kind: Kind,

    /// Memory pool of the backing objects.
    pub heap_type: HeapType,

    /// Bytes held in backing objects.
    pub reserved: u64,

    /// Bytes handed out, including memory waiting for the GPU.
    pub used: u64,

    /// Number of backing objects.
    pub backing_objects: u64,

    /// Number of requests that couldn't be satisfied.
    pub failed_allocations: u64,
}

/// Stats of every allocator of `Allocators`.
#[derive(Clone, Debug)]
pub struct TotalUtilization {
    /// Named stats.
    pub allocators: Vec<(&'static str, AllocatorStats)>,
}

impl TotalUtilization {
    /// Bytes held in backing objects by all allocators.
    pub fn reserved(&self) -> u64 {
        self.allocators.iter().map(|(_, stats)| stats.reserved).sum()
    }

    /// Bytes handed out by all allocators.
    pub fn used(&self) -> u64 {
        self.allocators.iter().map(|(_, stats)| stats.used).sum()
    }
}

impl std::fmt::Display for TotalUtilization {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const KB: u64 = 1024;

        writeln!(fmt, "!!! GPU memory utilization !!!")?;
        for (name, stats) in &self.allocators {
            let permyriad = if stats.reserved > 0 {
                (stats.used * 10000 / stats.reserved).min(10000)
            } else {
                0
            };
            let fill = (permyriad / 200) as usize;

            let line = ("|".repeat(fill) + &(" ".repeat(50 - fill)))
                .gradient_with_color(Color::Green, Color::Red);
            writeln!(
                fmt,
                "{} ({:?}, {:?}):\n{:>8} / {:<8} or{} [{}]",
                format!("{}", name).magenta(),
                stats.kind,
                stats.heap_type,
                format!("{}KB", stats.used / KB),
                format!("{}KB", stats.reserved / KB),
                format_permyriad(permyriad),
                line
            )?;

            let failed = format!("{}", stats.failed_allocations);
            writeln!(
                fmt,
                "         backing objects: {}, failed allocations: {}",
                stats.backing_objects,
                if stats.failed_allocations > 0 {
                    failed.red()
                } else {
                    failed.white()
                },
            )?;
        }

        Ok(())
    }
}

fn format_permyriad(permyriad: u64) -> CString {
    debug_assert!(permyriad <= 10000);
    let s = format!("{:>3}.{:02}%", permyriad / 100, permyriad % 100);
    if permyriad > 7500 {
        s.red()
    } else if permyriad > 5000 {
        s.yellow()
    } else if permyriad > 2500 {
        s.green()
    } else if permyriad > 100 {
        s.blue()
    } else {
        s.white()
    }
}
