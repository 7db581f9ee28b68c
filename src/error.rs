//! Error types.

use thiserror::Error;

/// Invalid engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
   /// Shard selection masks the key hash, so the shard count must be a power of two.
   #[error("shard count must be a power of two, got {0}")]
   NotPowerOfTwo(usize),
}

/// Error delivered to a caller of [`Group::execute`](crate::Group::execute) and friends.
///
/// Every variant except [`DeadlineExceeded`](FlightError::DeadlineExceeded) is
/// part of the shared outcome: the owner and all waiters of one flight receive
/// equal copies of it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlightError<E> {
   /// The computation returned an error. It is passed through untouched.
   #[error(transparent)]
   Failed(E),

   /// The computation panicked. Holds the panic message when it was a string.
   #[error("computation panicked: {0}")]
   Panicked(String),

   /// The owner went away without publishing an outcome.
   #[error("owner abandoned the in-flight call")]
   Abandoned,

   /// This caller stopped waiting before the shared call finished.
   ///
   /// Only the caller whose deadline passed sees this; the call itself keeps
   /// running for the owner and the remaining waiters.
   #[error("deadline exceeded while waiting for in-flight call")]
   DeadlineExceeded,
}

impl<E> FlightError<E> {
   /// Returns the computation's own error, if that is what this is.
   #[inline]
   pub fn failed(&self) -> Option<&E> {
      match self {
         Self::Failed(e) => Some(e),
         _ => None,
      }
   }

   /// Consumes `self`, returning the computation's own error if present.
   #[inline]
   pub fn into_failed(self) -> Option<E> {
      match self {
         Self::Failed(e) => Some(e),
         _ => None,
      }
   }

   /// Checks if this caller gave up waiting.
   #[inline]
   pub fn is_deadline_exceeded(&self) -> bool {
      matches!(self, Self::DeadlineExceeded)
   }

   /// Checks if the computation panicked.
   #[inline]
   pub fn is_panic(&self) -> bool {
      matches!(self, Self::Panicked(_))
   }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
   if let Some(s) = payload.downcast_ref::<&'static str>() {
      (*s).to_owned()
   } else if let Some(s) = payload.downcast_ref::<String>() {
      s.clone()
   } else {
      "non-string panic payload".to_owned()
   }
}
