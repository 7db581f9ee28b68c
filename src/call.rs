//! The record of one in-flight execution.
//!
//! A [`Call`] is created by the owner of a key, shared with every waiter that
//! joins while it is registered, and holds the single outcome they all
//! receive. The outcome slot is written exactly once, before the completion
//! gate opens, and is only read after a waiter has observed the gate open.

use core::cell::UnsafeCell;
use core::mem;
use core::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::error::FlightError;
use crate::state::CallState;

/// Result shared by everyone who took part in a flight.
pub(crate) type Outcome<T, E> = Result<T, FlightError<E>>;

/// One in-flight execution and its eventual outcome.
pub(crate) struct Call<T, E> {
   outcome: UnsafeCell<mem::MaybeUninit<Outcome<T, E>>>,
   /// Set by the first `release`; guards the outcome slot against a second writer.
   claimed: AtomicBool,
   state: CallState,
   #[cfg(feature = "async-tokio")]
   notify: tokio::sync::Notify,
}

impl<T, E> Call<T, E> {
   /// Creates a pending call.
   #[inline]
   pub(crate) fn new() -> Self {
      Self {
         outcome: UnsafeCell::new(mem::MaybeUninit::uninit()),
         claimed: AtomicBool::new(false),
         state: CallState::new(),
         #[cfg(feature = "async-tokio")]
         notify: tokio::sync::Notify::new(),
      }
   }

   /// Checks if the outcome has been published.
   ///
   /// This method never blocks.
   #[inline]
   pub(crate) fn is_done(&self) -> bool {
      self.state.is_done(Ordering::Acquire)
   }

   /// Publishes `outcome` and wakes every waiter.
   ///
   /// Only the first release takes effect; later ones drop their outcome and
   /// return `false`.
   pub(crate) fn release(&self, outcome: Outcome<T, E>) -> bool {
      if self.claimed.swap(true, Ordering::AcqRel) {
         return false;
      }
      // SAFETY: `claimed` makes us the only writer, and no reader touches the
      // slot before `set_done` below publishes it.
      unsafe { (*self.outcome.get()).write(outcome) };
      self.state.set_done();
      #[cfg(feature = "async-tokio")]
      self.notify.notify_waiters();
      true
   }

   /// Returns the published outcome, or `None` while the call is still running.
   #[inline]
   pub(crate) fn outcome(&self) -> Option<&Outcome<T, E>> {
      if self.is_done() {
         // SAFETY: DONE is only set after the slot was written, and the Acquire
         // load in `is_done` pairs with the Release in `set_done`. The slot is
         // never written again.
         Some(unsafe { (*self.outcome.get()).assume_init_ref() })
      } else {
         None
      }
   }

   /// Blocks until the outcome is published.
   #[inline]
   pub(crate) fn wait(&self) {
      self.state.wait();
   }

   /// Blocks until the outcome is published or `deadline` passes.
   ///
   /// Returns `false` on timeout.
   #[inline]
   pub(crate) fn wait_deadline(&self, deadline: Instant) -> bool {
      self.state.wait_deadline(deadline)
   }

   /// Waits for the outcome without blocking the executor.
   ///
   /// Cancel safe: dropping the future only stops this waiter.
   #[cfg(feature = "async-tokio")]
   pub(crate) async fn wait_async(&self) {
      loop {
         let mut notified = core::pin::pin!(self.notify.notified());
         // Register before checking, so a release between the check and the
         // await still wakes us.
         notified.as_mut().enable();
         if self.is_done() {
            return;
         }
         notified.await;
      }
   }
}

// SAFETY: the outcome is written once by the owner and then only read through
// shared references, so sharing a `Call` needs `T`/`E` to be `Send + Sync`.
unsafe impl<T: Send + Sync, E: Send + Sync> Sync for Call<T, E> {}
// SAFETY: moving a `Call` moves its (possibly initialized) outcome.
unsafe impl<T: Send, E: Send> Send for Call<T, E> {}

impl<T, E> Drop for Call<T, E> {
   #[inline]
   fn drop(&mut self) {
      if self.state.is_done(Ordering::Relaxed) {
         // SAFETY: DONE implies the slot was initialized, and `&mut self` means
         // nobody else can still be reading it.
         unsafe { self.outcome.get_mut().assume_init_drop() };
      }
   }
}
