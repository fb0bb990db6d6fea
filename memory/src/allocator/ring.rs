use std::collections::VecDeque;

use subheap_core::Fence;

/// Ring of `capacity` units with fence gated reclamation.
///
/// `head` and `tail` grow monotonically, position in the ring is taken modulo capacity.
/// Units between `tail` and `head` are in flight until the fence value
/// they were allocated with is complete.
#[derive(Clone, Debug)]
pub struct RingBuffer {
    capacity: u64,
    head: u64,
    tail: u64,

    /// End of in-flight range and fence value it waits for.
    /// Consecutive allocations with the same fence value share one entry.
    in_flight: VecDeque<(u64, u64)>,
}

impl RingBuffer {
    /// Create empty ring of `capacity` units.
    pub fn new(capacity: u64) -> Self {
        RingBuffer {
            capacity,
            head: 0,
            tail: 0,
            in_flight: VecDeque::new(),
        }
    }

    /// Capacity in units.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Units in flight, including wrap padding.
    pub fn used(&self) -> u64 {
        self.head - self.tail
    }

    /// Drop every allocation and change capacity.
    pub fn reset(&mut self, capacity: u64) {
        self.capacity = capacity;
        self.head = 0;
        self.tail = 0;
        self.in_flight.clear();
    }

    /// Free ranges with completed fence values.
    pub fn retire(&mut self, fence: &Fence) {
        while let Some(&(end, fence_value)) = self.in_flight.front() {
            if !fence.is_complete(fence_value) {
                break;
            }
            self.tail = end;
            self.in_flight.pop_front();
        }
    }

    fn claim(&mut self, units: u64, fence_value: u64) -> u64 {
        let offset = self.head % self.capacity;
        self.head += units;
        let head = self.head;
        match self.in_flight.back_mut() {
            Some(last) if last.1 == fence_value => last.0 = head,
            _ => self.in_flight.push_back((head, fence_value)),
        }
        offset
    }

    /// Allocate contiguous run of `units`, tagged with the current value of `fence`.
    /// Run that would cross the end of the ring starts at the beginning,
    /// the skipped tail is claimed as padding.
    ///
    /// Returns offset of the run in units.
    pub fn allocate(&mut self, units: u64, fence: &Fence) -> Option<u64> {
        if units == 0 || units > self.capacity {
            return None;
        }

        self.retire(fence);
        let fence_value = fence.current_value();

        let position = self.head % self.capacity;
        if position + units > self.capacity {
            let padding = self.capacity - position;
            if self.used() + padding > self.capacity {
                return None;
            }
            log::trace!("Ring wraps, {} units of padding", padding);
            self.claim(padding, fence_value);
        }

        if self.used() + units > self.capacity {
            return None;
        }
        Some(self.claim(units, fence_value))
    }
}
