//! Wait-free single-writer snapshot exchange.
//!
//! Two value slots and a pair of sequence counters. The writer bumps `begin`,
//! copies the new value into the slot readers are not looking at, then bumps
//! `end`. A reader copies the slot named by `end` and keeps the copy only if
//! no publish started meanwhile, otherwise it takes the other slot and
//! validates again. Readers never wait on the writer and the writer never
//! waits on readers.
//!
//! The writer half is a unique [`Publisher`]; any number of [`Reader`] clones
//! may observe it from other threads.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;

struct Slots<T> {
    begin: AtomicUsize,
    end: AtomicUsize,
    values: [UnsafeCell<T>; 2],
}

// SAFETY: values are only moved in and out by copy; concurrent access is
// arbitrated by the sequence counters and torn copies are discarded before
// they are interpreted.
unsafe impl<T: Copy + Send> Send for Slots<T> {}
unsafe impl<T: Copy + Send> Sync for Slots<T> {}

impl<T: Copy> Slots<T> {
    /// Copies a slot without interpreting it.
    ///
    /// # Safety
    /// The copy may race with the writer; callers must validate the sequence
    /// counters before calling `assume_init` on the result.
    unsafe fn copy_out(&self, index: usize) -> MaybeUninit<T> {
        ptr::read_volatile(self.values[index & 1].get() as *const MaybeUninit<T>)
    }
}

/// Creates an exchange seeded with `initial` in both slots.
pub fn slot_exchange<T: Copy + Send>(initial: T) -> (Publisher<T>, Reader<T>) {
    let slots = Arc::new(Slots {
        begin: AtomicUsize::new(0),
        end: AtomicUsize::new(0),
        values: [UnsafeCell::new(initial), UnsafeCell::new(initial)],
    });
    (
        Publisher {
            slots: Arc::clone(&slots),
            last: initial,
        },
        Reader { slots },
    )
}

/// The single writer of an exchange.
pub struct Publisher<T: Copy> {
    slots: Arc<Slots<T>>,
    last: T,
}

impl<T: Copy + Send> Publisher<T> {
    /// Publishes `value`. Never blocks.
    pub fn publish(&mut self, value: T) {
        let slot = self.slots.begin.fetch_add(1, Ordering::AcqRel) & 1;
        fence(Ordering::Release);
        // SAFETY: `&mut self` makes this the only writer. Readers racing on
        // this slot detect the bumped `begin` and discard their copy.
        unsafe { ptr::write_volatile(self.slots.values[slot ^ 1].get(), value) };
        self.slots.end.fetch_add(1, Ordering::Release);
        self.last = value;
    }

    /// The value most recently handed to [`publish`](Self::publish).
    pub fn current(&self) -> T {
        self.last
    }

    pub fn reader(&self) -> Reader<T> {
        Reader {
            slots: Arc::clone(&self.slots),
        }
    }
}

/// A wait-free observer of an exchange.
pub struct Reader<T: Copy> {
    slots: Arc<Slots<T>>,
}

impl<T: Copy> Clone for Reader<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T: Copy + Send> Reader<T> {
    /// Returns the latest published value or the one immediately before it.
    pub fn read(&self) -> T {
        let slots = &*self.slots;
        loop {
            let end = slots.end.load(Ordering::Acquire);
            // SAFETY: validated against `begin` below before use.
            let value = unsafe { slots.copy_out(end) };
            fence(Ordering::Acquire);
            let begin = slots.begin.load(Ordering::Relaxed);
            if begin == end {
                // SAFETY: no publish overlapped the copy.
                return unsafe { value.assume_init() };
            }

            // A publish is in flight into `begin`'s slot; the other one holds
            // the last completed value.
            let value = unsafe { slots.copy_out((begin & 1) ^ 1) };
            fence(Ordering::Acquire);
            if slots.begin.load(Ordering::Relaxed) == begin {
                // SAFETY: no further publish started while copying.
                return unsafe { value.assume_init() };
            }
        }
    }
}
