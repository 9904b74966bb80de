//! Bounded lock-free SPSC queue.
//!
//! Carries controller commands to the computation thread. Pushing never
//! blocks the controller and popping never blocks the computation thread;
//! a full queue is reported back to the pusher.
//!
//! ```
//! use emu_thread::sync::spsc;
//!
//! let (tx, rx) = spsc::channel::<&str>(4);
//! tx.push("reset").unwrap();
//! assert_eq!(rx.pop(), Some("reset"));
//! assert_eq!(rx.pop(), None);
//! ```

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Keeps the producer's and consumer's hot indices on separate cache lines.
#[repr(align(64))]
struct CachePadded<T>(T);

struct Shared<T> {
    /// Total pushes. Written by the producer only.
    head: CachePadded<AtomicUsize>,
    /// Total pops. Written by the consumer only.
    tail: CachePadded<AtomicUsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: a slot is written only by the producer while `head - tail < cap`
// keeps the consumer away from it, and read only by the consumer after the
// producer published it with a Release store of `head`.
unsafe impl<T: Send> Sync for Shared<T> {}
unsafe impl<T: Send> Send for Shared<T> {}

impl<T> Shared<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let head = *self.head.0.get_mut();
        let tail = *self.tail.0.get_mut();
        let cap = self.slots.len();
        for seq in tail..head {
            // SAFETY: every slot between tail and head holds a pushed value
            // that was never popped, and we have exclusive access here.
            unsafe { self.slots[seq % cap].get_mut().assume_init_drop() };
        }
    }
}

/// Opts out of `Sync` while staying `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end. `Send` but not `Sync`: exactly one thread pushes.
pub struct Producer<T: Send> {
    shared: Arc<Shared<T>>,
    cached_tail: Cell<usize>,
    _unsync: PhantomUnsync,
}

/// Read end. `Send` but not `Sync`: exactly one thread pops.
pub struct Consumer<T: Send> {
    shared: Arc<Shared<T>>,
    cached_head: Cell<usize>,
    _unsync: PhantomUnsync,
}

/// Creates a queue holding at most `capacity` items.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn channel<T: Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0, "queue capacity must be > 0");

    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();
    let shared = Arc::new(Shared {
        head: CachePadded(AtomicUsize::new(0)),
        tail: CachePadded(AtomicUsize::new(0)),
        slots,
    });

    let producer = Producer {
        shared: Arc::clone(&shared),
        cached_tail: Cell::new(0),
        _unsync: PhantomData,
    };
    let consumer = Consumer {
        shared,
        cached_head: Cell::new(0),
        _unsync: PhantomData,
    };
    (producer, consumer)
}

impl<T: Send> Producer<T> {
    /// Pushes without blocking.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let shared = &*self.shared;
        let cap = shared.capacity();
        let head = shared.head.0.load(Ordering::Relaxed);

        if head.wrapping_sub(self.cached_tail.get()) >= cap {
            self.cached_tail.set(shared.tail.0.load(Ordering::Acquire));
            if head.wrapping_sub(self.cached_tail.get()) >= cap {
                return Err(item);
            }
        }

        // SAFETY: head - tail < cap, so the consumer is not looking at this
        // slot, and only this producer writes slots.
        unsafe { (*shared.slots[head % cap].get()).write(item) };
        shared.head.0.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }
}

impl<T: Send> Consumer<T> {
    /// Pops without blocking. `None` when empty.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let shared = &*self.shared;
        let tail = shared.tail.0.load(Ordering::Relaxed);

        if self.cached_head.get() == tail {
            self.cached_head.set(shared.head.0.load(Ordering::Acquire));
            if self.cached_head.get() == tail {
                return None;
            }
        }

        // SAFETY: tail != head, so the producer published this slot with a
        // Release store we synchronized with, and won't reuse it until we
        // advance tail below.
        let item = unsafe { (*shared.slots[tail % shared.capacity()].get()).assume_init_read() };
        shared.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Pops everything currently visible.
    pub fn drain(&self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(|| self.pop())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.head.0.load(Ordering::Acquire) == self.shared.tail.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_in_order() {
        let (producer, consumer) = channel::<u32>(8);
        for i in 0..5 {
            producer.push(i).unwrap();
        }
        assert_eq!(consumer.drain().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert!(consumer.is_empty());
    }

    #[test]
    fn full_queue_returns_item() {
        let (producer, consumer) = channel::<u32>(2);
        producer.push(1).unwrap();
        producer.push(2).unwrap();
        assert_eq!(producer.push(3), Err(3));

        assert_eq!(consumer.pop(), Some(1));
        producer.push(3).unwrap();
        assert_eq!(consumer.drain().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn wraps_many_times() {
        let (producer, consumer) = channel::<usize>(3);
        for round in 0..50 {
            producer.push(round).unwrap();
            producer.push(round + 1000).unwrap();
            assert_eq!(consumer.pop(), Some(round));
            assert_eq!(consumer.pop(), Some(round + 1000));
        }
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn unpopped_items_are_dropped() {
        let marker = Arc::new(());
        {
            let (producer, _consumer) = channel::<Arc<()>>(4);
            producer.push(Arc::clone(&marker)).unwrap();
            producer.push(Arc::clone(&marker)).unwrap();
            assert_eq!(Arc::strong_count(&marker), 3);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn cross_thread_fifo() {
        let (producer, consumer) = channel::<u64>(16);
        let count = 5_000u64;

        let handle = std::thread::spawn(move || {
            for i in 0..count {
                let mut item = i;
                while let Err(back) = producer.push(item) {
                    item = back;
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 0;
        while expected < count {
            if let Some(v) = consumer.pop() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        handle.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "queue capacity must be > 0")]
    fn zero_capacity_panics() {
        let _ = channel::<u8>(0);
    }
}
