//! Scheduling Primitives - Wait/Wakeup on Events
//!
//! Based on Mach4 kern/sched_prim.h/c
//!
//! Threads wait on an event (an address cast to an integer). The Mach
//! protocol is kept: `assert_wait` is called while the caller still holds
//! the lock protecting the condition, the lock is released, and then
//! `thread_block` sleeps. A wakeup that lands between the release and the
//! block is not lost, because the ticket returned by `assert_wait` records
//! the event generation it was issued against.
//!
//! There is no run queue: `thread_block` spins until the event is posted.
//! A thread that waits for an event only it can post, such as faulting on
//! a page it holds busy from a page-list copy, never returns.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

// ============================================================================
// Wait Results
// ============================================================================

/// Result of a wait operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WaitResult {
    /// Woken by `thread_wakeup`
    Awakened = 0,
    /// The event had already been posted before blocking
    NotWaiting = 1,
}

/// Event that threads can wait on
pub type WaitEvent = u64;

/// Derive an event from the address of a kernel structure
pub fn event_from_addr<T: ?Sized>(addr: &T) -> WaitEvent {
    addr as *const T as *const u8 as usize as WaitEvent
}

// ============================================================================
// Wait Queue
// ============================================================================

#[derive(Debug, Default)]
struct EventState {
    /// Bumped by every wakeup on the event
    generation: u64,
    /// Threads between `assert_wait` and the end of `thread_block`
    waiters: u32,
}

/// Pending waits keyed by event
#[derive(Debug, Default)]
struct WaitQueue {
    events: BTreeMap<WaitEvent, EventState>,
}

static WAIT_QUEUE: Mutex<WaitQueue> = Mutex::new(WaitQueue {
    events: BTreeMap::new(),
});

static WAKEUPS: AtomicU64 = AtomicU64::new(0);

/// Proof that the caller announced its intent to wait on an event
#[derive(Debug)]
#[must_use = "an asserted wait must be completed with thread_block"]
pub struct WaitTicket {
    event: WaitEvent,
    generation: u64,
}

impl WaitTicket {
    pub fn event(&self) -> WaitEvent {
        self.event
    }
}

/// Announce that the current thread is about to wait for `event`
pub fn assert_wait(event: WaitEvent) -> WaitTicket {
    let mut queue = WAIT_QUEUE.lock();
    let state = queue.events.entry(event).or_default();
    state.waiters += 1;
    WaitTicket {
        event,
        generation: state.generation,
    }
}

/// Block until the event of `ticket` is posted
///
/// Busy-waits; the caller must not hold a lock the waker needs.
pub fn thread_block(ticket: WaitTicket) -> WaitResult {
    let mut first = true;
    loop {
        {
            let mut queue = WAIT_QUEUE.lock();
            let posted = match queue.events.get(&ticket.event) {
                Some(state) => state.generation != ticket.generation,
                None => true,
            };
            if posted {
                if let Some(state) = queue.events.get_mut(&ticket.event) {
                    state.waiters -= 1;
                    if state.waiters == 0 {
                        queue.events.remove(&ticket.event);
                    }
                }
                return if first {
                    WaitResult::NotWaiting
                } else {
                    WaitResult::Awakened
                };
            }
        }
        first = false;
        core::hint::spin_loop();
    }
}

/// Withdraw an asserted wait without blocking (clear_wait)
pub fn clear_wait(ticket: WaitTicket) {
    let mut queue = WAIT_QUEUE.lock();
    if let Some(state) = queue.events.get_mut(&ticket.event) {
        state.waiters -= 1;
        if state.waiters == 0 {
            queue.events.remove(&ticket.event);
        }
    }
}

/// Wake every thread waiting on `event`; returns how many were waiting
pub fn thread_wakeup(event: WaitEvent) -> usize {
    let mut queue = WAIT_QUEUE.lock();
    match queue.events.get_mut(&event) {
        Some(state) => {
            state.generation = state.generation.wrapping_add(1);
            WAKEUPS.fetch_add(1, Ordering::Relaxed);
            state.waiters as usize
        }
        None => 0,
    }
}

/// Whether any thread has asserted a wait on `event`
pub fn has_waiters(event: WaitEvent) -> bool {
    WAIT_QUEUE
        .lock()
        .events
        .get(&event)
        .map(|state| state.waiters > 0)
        .unwrap_or(false)
}

/// Total wakeups that found at least one waiter
pub fn wakeup_count() -> u64 {
    WAKEUPS.load(Ordering::Relaxed)
}
