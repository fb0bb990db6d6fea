use std::{collections::VecDeque, sync::Arc};

use {
    crossbeam_channel::{Receiver, Sender},
    parking_lot::Mutex,
    smallvec::SmallVec,
    subheap_core::{Device, Fence},
};

/// GPU object waiting for destruction.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub enum Garbage<D: Device> {
    /// Resource, committed or placed.
    Resource(D::Resource),

    /// Heap. Every resource placed in it must be released first.
    Heap(D::Heap),
}

impl<D> Garbage<D>
where
    D: Device,
{
    unsafe fn release(self, device: &D) {
        match self {
            Garbage::Resource(resource) => device.destroy_resource(resource),
            Garbage::Heap(heap) => device.destroy_heap(heap),
        }
    }
}

#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
struct Enqueued<D: Device> {
    garbage: Garbage<D>,
    fence_value: u64,
}

/// Cheap handle to enqueue objects into `DeferredDeletionQueue` from any thread.
#[derive(derivative::Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""))]
pub struct DeletionSender<D: Device> {
    #[derivative(Debug = "ignore")]
    sender: Sender<Enqueued<D>>,
    #[derivative(Debug = "ignore")]
    fence: Arc<Fence>,
}

impl<D> DeletionSender<D>
where
    D: Device,
{
    /// Enqueue object for destruction once GPU work submitted so far is complete.
    pub fn defer(&self, garbage: Garbage<D>) {
        let fence_value = self.fence.current_value();
        log::trace!("Defer {:?} until fence value {}", garbage, fence_value);
        if let Err(err) = self.sender.send(Enqueued {
            garbage,
            fence_value,
        }) {
            log::error!(
                "Deletion queue is gone. {:?} leaks",
                err.into_inner().garbage
            );
        }
    }
}

/// Defers destruction of GPU objects until GPU work referencing them is retired.
///
/// Objects go through `Enqueued(fence value) -> Eligible -> Released`.
/// Object becomes eligible once its fence value is observed complete
/// and is released by the same `release_resources` sweep.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct DeferredDeletionQueue<D: Device> {
    device: Arc<D>,
    fence: Arc<Fence>,
    #[derivative(Debug = "ignore")]
    sender: Sender<Enqueued<D>>,
    #[derivative(Debug = "ignore")]
    receiver: Receiver<Enqueued<D>>,
    pending: Mutex<VecDeque<Enqueued<D>>>,
}

impl<D> DeferredDeletionQueue<D>
where
    D: Device,
{
    /// Create new queue gated by `fence`.
    pub fn new(device: Arc<D>, fence: Arc<Fence>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        DeferredDeletionQueue {
            device,
            fence,
            sender,
            receiver,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Get sender handle for this queue.
    pub fn sender(&self) -> DeletionSender<D> {
        DeletionSender {
            sender: self.sender.clone(),
            fence: self.fence.clone(),
        }
    }

    /// Enqueue object for destruction.
    pub fn defer(&self, garbage: Garbage<D>) {
        self.sender().defer(garbage);
    }

    /// Number of objects not yet released.
    pub fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock();
        pending.extend(self.receiver.try_iter());
        pending.len()
    }

    /// Release every object whose fence value is complete.
    /// With `delete_immediately` fence values are ignored,
    /// which is valid only when the GPU is idle.
    ///
    /// Returns number of released objects.
    pub fn release_resources(&self, delete_immediately: bool) -> usize {
        let eligible: SmallVec<[Enqueued<D>; 16]> = {
            let mut pending = self.pending.lock();
            pending.extend(self.receiver.try_iter());

            let fence = &self.fence;
            let mut eligible = SmallVec::new();
            let mut index = 0;
            while index < pending.len() {
                if delete_immediately || fence.is_complete(pending[index].fence_value) {
                    eligible.extend(pending.remove(index));
                } else {
                    index += 1;
                }
            }
            eligible
        };

        let count = eligible.len();
        for enqueued in eligible {
            log::trace!("Release {:?}", enqueued.garbage);
            unsafe {
                enqueued.garbage.release(&self.device);
            }
        }

        if count > 0 {
            log::debug!("Released {} deferred objects", count);
        }
        count
    }
}

impl<D> Drop for DeferredDeletionQueue<D>
where
    D: Device,
{
    fn drop(&mut self) {
        let pending = self.pending_count();
        if pending > 0 {
            log::error!(
                "Deletion queue dropped with {} objects pending. They leak",
                pending
            );
        }
    }
}
