//! One-shot completion gate for in-flight calls.
//!
//! The gate is a single `AtomicU8` that moves from pending to done exactly once.
//! Blocked waiters are parked on the address of that byte through
//! `parking_lot_core`, so waiting costs nothing until someone actually has to
//! sleep, and a release wakes every parked thread at once.
//!
//! Layout:
//! - Bit 0: DONE - the owner has published the outcome
//! - Bit 1: WAITING - at least one thread parked (or is about to park)

use core::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use parking_lot_core::{ParkResult, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

/// Atomic completion state for a `Call`.
#[repr(transparent)]
pub(crate) struct CallState(AtomicU8);

impl CallState {
   /// Bit flag: outcome is published.
   const DONE: u8 = 1;
   /// Bit flag: at least one thread is parked on this gate.
   const WAITING: u8 = 2;

   /// Creates a gate in the pending state.
   #[inline]
   pub(crate) const fn new() -> Self {
      Self(AtomicU8::new(0))
   }

   #[inline]
   fn key(&self) -> usize {
      self.0.as_ptr() as usize
   }

   /// Checks if the DONE flag is set.
   #[inline]
   pub(crate) fn is_done(&self, ordering: Ordering) -> bool {
      self.0.load(ordering) & Self::DONE != 0
   }

   /// Opens the gate and wakes every parked waiter.
   ///
   /// Release ordering makes every write the owner did before this call (the
   /// outcome in particular) visible to any thread that observes DONE with an
   /// Acquire load. Returns `true` if the gate was still pending.
   #[inline]
   pub(crate) fn set_done(&self) -> bool {
      let prev_state = self.0.swap(Self::DONE, Ordering::Release);

      if prev_state & Self::WAITING != 0 {
         // SAFETY: waiters park on the same address in `park_until`.
         unsafe {
            parking_lot_core::unpark_all(self.key(), DEFAULT_UNPARK_TOKEN);
         }
      }

      prev_state & Self::DONE == 0
   }

   /// Blocks until the gate is open. Returns immediately if it already is.
   pub(crate) fn wait(&self) {
      // `None` never times out, so the result is always `true`.
      let _ = self.park_until(None);
   }

   /// Blocks until the gate is open or `deadline` passes.
   ///
   /// Returns `true` if the gate opened, `false` on timeout. A timeout leaves
   /// the gate untouched.
   pub(crate) fn wait_deadline(&self, deadline: Instant) -> bool {
      self.park_until(Some(deadline))
   }

   fn park_until(&self, deadline: Option<Instant>) -> bool {
      loop {
         let current_state = self.0.load(Ordering::Acquire);
         if current_state & Self::DONE != 0 {
            return true;
         }

         // Announce ourselves before sleeping so `set_done` knows to unpark.
         if current_state & Self::WAITING == 0 {
            if self
               .0
               .compare_exchange_weak(
                  current_state,
                  current_state | Self::WAITING,
                  Ordering::Relaxed,
                  Ordering::Relaxed,
               )
               .is_err()
            {
               std::hint::spin_loop();
               continue;
            }
         }

         let expected_state = current_state | Self::WAITING;
         // SAFETY: the key is the address of our own atomic, matching `set_done`.
         // `park` validates under the bucket lock, so a release between our
         // load and the sleep cannot be missed.
         let result = unsafe {
            parking_lot_core::park(
               self.key(),
               || self.0.load(Ordering::Acquire) == expected_state,
               || {},
               |_, _| {},
               DEFAULT_PARK_TOKEN,
               deadline,
            )
         };

         if let ParkResult::TimedOut = result {
            return self.is_done(Ordering::Acquire);
         }
         // Unparked, invalid or spurious: re-check the state.
      }
   }
}
