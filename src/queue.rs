//! # Fiber Queues
//!
//! Intrusive doubly-linked lists of fiber records. A record carries its own
//! `prev`/`next` links plus a back-pointer to the owning queue, so unlinking
//! is O(1) from the record alone, with no search.
//!
//! Insertion is always at the head: queues are short, and the cost of
//! keeping them ordered outweighs any gain. In particular the sleep queue
//! keeps no deadline order; the tick handler walks the whole list.
//!
//! Both operations run inside a critical section; the interrupt state is
//! restored when the bracket exits.

use core::ptr;

use crate::fiber::Fiber;
use crate::sync;

/// Head of an intrusive fiber list. A queue must not move in memory while
/// any record is linked into it: linked records point back at it.
pub struct FiberQueue {
    head: *mut Fiber,
}

impl FiberQueue {
    pub const fn new() -> Self {
        FiberQueue {
            head: ptr::null_mut(),
        }
    }

    /// First record on the queue, or null.
    pub fn head(&self) -> *mut Fiber {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Insert `f` at the head of this queue and take ownership of it.
    ///
    /// # Safety
    /// `f` must point to a live record that is currently off-queue.
    pub unsafe fn push(&mut self, f: *mut Fiber) {
        let this = self as *mut FiberQueue;
        sync::critical_section(|_| unsafe {
            (*f).queue = this;
            (*f).next = (*this).head;
            (*f).prev = ptr::null_mut();

            if !(*this).head.is_null() {
                (*(*this).head).prev = f;
            }

            (*this).head = f;
        })
    }
}

/// Unlink `f` from whichever queue currently owns it. A no-op if `f` is
/// already off-queue.
///
/// # Safety
/// `f` must point to a live record.
pub unsafe fn dequeue(f: *mut Fiber) {
    sync::critical_section(|_| unsafe {
        let q = (*f).queue;
        if q.is_null() {
            return;
        }

        if !(*f).prev.is_null() {
            (*(*f).prev).next = (*f).next;
        } else {
            (*q).head = (*f).next;
        }

        if !(*f).next.is_null() {
            (*(*f).next).prev = (*f).prev;
        }

        (*f).next = ptr::null_mut();
        (*f).prev = ptr::null_mut();
        (*f).queue = ptr::null_mut();
    })
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    fn record() -> *mut Fiber {
        Fiber::allocate().expect("failed to allocate record").as_ptr()
    }

    #[test]
    fn push_links_head_first() {
        let mut q = Box::new(FiberQueue::new());
        let a = record();
        let b = record();

        unsafe {
            q.push(a);
            q.push(b);

            // Head insertion: most recent first.
            assert_eq!(q.head(), b);
            assert_eq!((*b).next, a);
            assert_eq!((*a).prev, b);
            assert!((*a).next.is_null());

            let owner = &mut *q as *mut FiberQueue;
            assert_eq!((*a).queue, owner);
            assert_eq!((*b).queue, owner);
        }
    }

    #[test]
    fn push_then_dequeue_restores_structure() {
        let mut q = Box::new(FiberQueue::new());
        let a = record();
        let b = record();

        unsafe {
            q.push(a);
            q.push(b);
            dequeue(b);

            assert_eq!(q.head(), a);
            assert!((*a).prev.is_null());
            assert!((*a).next.is_null());
            assert!((*b).queue.is_null());
            assert!((*b).prev.is_null());
            assert!((*b).next.is_null());

            dequeue(a);
            assert!(q.is_empty());
        }
    }

    #[test]
    fn dequeue_from_middle() {
        let mut q = Box::new(FiberQueue::new());
        let a = record();
        let b = record();
        let c = record();

        unsafe {
            q.push(a);
            q.push(b);
            q.push(c);

            // c -> b -> a; unlink the middle record.
            dequeue(b);
            assert_eq!(q.head(), c);
            assert_eq!((*c).next, a);
            assert_eq!((*a).prev, c);
            assert!((*b).queue.is_null());
        }
    }

    #[test]
    fn dequeue_off_queue_is_noop() {
        let q = Box::new(FiberQueue::new());
        let a = record();

        unsafe {
            dequeue(a);
            assert!((*a).queue.is_null());
        }
        assert!(q.is_empty());
    }
}
