//! The deduplication engine.
//!
//! A [`Group`] owns a fixed table of shards. Each shard pairs a
//! `parking_lot::RwLock` with a map from key to the [`Call`] currently in
//! flight for that key. Callers either register a new call and run the
//! computation themselves (the owner), or find an existing call and wait for
//! its outcome (waiters). The record is removed as soon as the owner has
//! published the outcome, so nothing is cached between flights.

use core::borrow::Borrow;
use core::fmt;
#[cfg(feature = "async-tokio")]
use core::future::Future;
use core::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, trace, warn};

use crate::call::{Call, Outcome};
use crate::error::{panic_message, ConfigError, FlightError};
use crate::shard::{resolve_shard_count, Shard, ShardKey, DEFAULT_SHARDS};

/// Deduplicates concurrent calls that share a key.
///
/// While a computation for some key is running, every other [`execute`] for
/// that key blocks and then receives a clone of the same outcome instead of
/// running the computation again. Once the computation finishes the key is
/// free, and the next call starts fresh work.
///
/// `Group` is a cheap handle: clones share the same registry, which makes it
/// easy to hand to spawned threads or tasks.
///
/// # Examples
///
/// ```rust
/// use shardflight::Group;
///
/// let group: Group<String, &'static str> = Group::new();
/// let value = group.execute("user:123", |key| Ok(format!("data_of_{key}")));
/// assert_eq!(value.unwrap(), "data_of_user:123");
/// ```
///
/// [`execute`]: Group::execute
pub struct Group<T, E, K = String> {
   inner: Arc<Inner<T, E, K>>,
}

struct Inner<T, E, K> {
   shards: Box<[Shard<K, T, E>]>,
   mask: u64,
}

/// What a caller became after looking up its key.
enum Role<T, E> {
   /// Registered the call; must run the computation and release it.
   Owner(Arc<Call<T, E>>),
   /// Found a call already in flight; waits for its outcome.
   Waiter(Arc<Call<T, E>>),
}

impl<T, E, K> Group<T, E, K>
where
   K: Hash + Eq + ShardKey,
{
   /// Creates a group with [`DEFAULT_SHARDS`] shards.
   #[inline]
   #[must_use]
   pub fn new() -> Self {
      Self::build(DEFAULT_SHARDS)
   }

   /// Creates a group with `shards` shards.
   ///
   /// Zero selects [`DEFAULT_SHARDS`].
   ///
   /// # Panics
   ///
   /// Panics if `shards` is neither zero nor a power of two. Use
   /// [`try_with_shards`](Group::try_with_shards) to handle that as an error.
   #[must_use]
   pub fn with_shards(shards: usize) -> Self {
      match Self::try_with_shards(shards) {
         Ok(group) => group,
         Err(err) => panic!("invalid shardflight configuration: {err}"),
      }
   }

   /// Creates a group with `shards` shards, rejecting counts that are not a
   /// power of two.
   ///
   /// Zero selects [`DEFAULT_SHARDS`].
   pub fn try_with_shards(shards: usize) -> Result<Self, ConfigError> {
      resolve_shard_count(shards).map(Self::build)
   }

   fn build(count: usize) -> Self {
      debug_assert!(count.is_power_of_two());
      let shards = (0..count).map(|_| Shard::new()).collect();
      Self {
         inner: Arc::new(Inner {
            shards,
            mask: (count - 1) as u64,
         }),
      }
   }

   /// Returns the number of shards. Fixed for the lifetime of the group.
   #[inline]
   pub fn shard_count(&self) -> usize {
      self.inner.shards.len()
   }

   /// Returns the index of the shard `key` is routed to.
   ///
   /// This is a pure function of the key and the shard count.
   #[inline]
   pub fn shard_index<Q>(&self, key: &Q) -> usize
   where
      Q: ShardKey + ?Sized,
   {
      (key.shard_hash() & self.inner.mask) as usize
   }

   #[inline]
   fn shard<Q>(&self, key: &Q) -> &Shard<K, T, E>
   where
      Q: ShardKey + ?Sized,
   {
      &self.inner.shards[self.shard_index(key)]
   }

   /// Checks if a call for `key` is currently in flight.
   ///
   /// The answer may be stale by the time it is returned.
   pub fn is_in_flight<Q>(&self, key: &Q) -> bool
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ShardKey + ?Sized,
   {
      self.shard(key).calls.read().contains_key(key)
   }

   /// Returns the number of calls in flight across all shards.
   ///
   /// Shards are read one at a time, so this is a snapshot, not an atomic count.
   pub fn in_flight(&self) -> usize {
      self
         .inner
         .shards
         .iter()
         .map(|shard| shard.calls.read().len())
         .sum()
   }

   /// Runs `f(key)` unless a call for `key` is already in flight, in which
   /// case waits for that call and returns its outcome.
   ///
   /// Every caller of one flight, owner and waiters alike, receives a clone of
   /// the same outcome:
   /// - `Ok(value)` if the computation succeeded,
   /// - [`FlightError::Failed`] with the computation's own error,
   /// - [`FlightError::Panicked`] if the computation panicked.
   ///
   /// The computation runs on the calling thread without any shard lock held,
   /// so it may call back into the group for other keys. Calling back for the
   /// *same* key from inside the computation waits on itself and never returns.
   #[instrument(level = "trace", skip_all, fields(shard = self.shard_index(key)))]
   pub fn execute<Q, F>(&self, key: &Q, f: F) -> Result<T, FlightError<E>>
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ShardKey + ToOwned<Owned = K> + ?Sized,
      F: FnOnce(&Q) -> Result<T, E>,
      T: Clone,
      E: Clone,
   {
      self.run(key, None, f)
   }

   /// Like [`execute`](Group::execute), but a caller that ends up waiting gives
   /// up at `deadline` with [`FlightError::DeadlineExceeded`].
   ///
   /// The deadline only bounds this caller's wait. The shared computation,
   /// its owner and the other waiters are not affected, and a caller that
   /// becomes the owner always runs the computation to completion.
   #[instrument(level = "trace", skip_all, fields(shard = self.shard_index(key)))]
   pub fn execute_until<Q, F>(
      &self,
      key: &Q,
      deadline: Instant,
      f: F,
   ) -> Result<T, FlightError<E>>
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ShardKey + ToOwned<Owned = K> + ?Sized,
      F: FnOnce(&Q) -> Result<T, E>,
      T: Clone,
      E: Clone,
   {
      self.run(key, Some(deadline), f)
   }

   /// Like [`execute_until`](Group::execute_until) with a deadline `timeout`
   /// from now.
   pub fn execute_timeout<Q, F>(
      &self,
      key: &Q,
      timeout: Duration,
      f: F,
   ) -> Result<T, FlightError<E>>
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ShardKey + ToOwned<Owned = K> + ?Sized,
      F: FnOnce(&Q) -> Result<T, E>,
      T: Clone,
      E: Clone,
   {
      match Instant::now().checked_add(timeout) {
         Some(deadline) => self.execute_until(key, deadline, f),
         // Too far out to represent; same as no deadline.
         None => self.execute(key, f),
      }
   }

   /// Async variant of [`execute`](Group::execute).
   ///
   /// The owner spawns the computation onto the current tokio runtime, and
   /// every caller (owner included) then waits for the outcome
   /// asynchronously. Dropping any caller's future, for example through
   /// `tokio::time::timeout`, only stops that caller from waiting. The
   /// computation keeps running and the other callers still get its outcome.
   ///
   /// # Panics
   ///
   /// Panics if called outside of a tokio runtime and this caller becomes the
   /// owner. Waiters of that flight then receive [`FlightError::Abandoned`].
   #[cfg(feature = "async-tokio")]
   #[instrument(level = "trace", skip_all, fields(shard = self.shard_index(&key)))]
   pub async fn execute_async<F, Fut>(&self, key: K, f: F) -> Result<T, FlightError<E>>
   where
      K: Clone + Send + Sync + 'static,
      T: Clone + Send + Sync + 'static,
      E: Clone + Send + Sync + 'static,
      F: FnOnce(K) -> Fut,
      Fut: Future<Output = Result<T, E>> + Send + 'static,
   {
      let call = match self.acquire(&key) {
         Role::Waiter(call) => call,
         Role::Owner(call) => {
            self.spawn_owner(key, Arc::clone(&call), f);
            call
         }
      };
      call.wait_async().await;
      trace!("async flight finished");
      Self::read(&call)
   }

   #[cfg(feature = "async-tokio")]
   fn spawn_owner<F, Fut>(&self, key: K, call: Arc<Call<T, E>>, f: F)
   where
      K: Clone + Send + Sync + 'static,
      T: Send + Sync + 'static,
      E: Send + Sync + 'static,
      F: FnOnce(K) -> Fut,
      Fut: Future<Output = Result<T, E>> + Send + 'static,
   {
      let shard = self.shard_index(&key);
      let guard = OwnerGuard::new(self.clone(), shard, key.clone(), call);
      let fut = match panic::catch_unwind(AssertUnwindSafe(|| f(key))) {
         Ok(fut) => fut,
         Err(payload) => {
            let message = panic_message(&*payload);
            warn!(%message, "computation panicked before producing a future");
            guard.finish(Err(FlightError::Panicked(message)));
            return;
         }
      };

      // The computation gets its own task so a panic surfaces as a `JoinError`
      // we can turn into an outcome.
      tokio::spawn(async move {
         let outcome = match tokio::spawn(fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(FlightError::Failed(e)),
            Err(err) if err.is_panic() => {
               let message = panic_message(&*err.into_panic());
               warn!(%message, "computation panicked");
               Err(FlightError::Panicked(message))
            }
            Err(_) => Err(FlightError::Abandoned),
         };
         guard.finish(outcome);
      });
   }

   fn run<Q, F>(&self, key: &Q, deadline: Option<Instant>, f: F) -> Outcome<T, E>
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ShardKey + ToOwned<Owned = K> + ?Sized,
      F: FnOnce(&Q) -> Result<T, E>,
      T: Clone,
      E: Clone,
   {
      let call = match self.acquire(key) {
         Role::Waiter(call) => return Self::join(&call, deadline),
         Role::Owner(call) => call,
      };

      let shard = self.shard_index(key);
      let guard = OwnerGuard::new(self.clone(), shard, key.to_owned(), call);
      trace!("running computation");
      let outcome = match panic::catch_unwind(AssertUnwindSafe(|| f(key))) {
         Ok(Ok(value)) => Ok(value),
         Ok(Err(e)) => Err(FlightError::Failed(e)),
         Err(payload) => {
            let message = panic_message(&*payload);
            warn!(%message, "computation panicked");
            Err(FlightError::Panicked(message))
         }
      };
      guard.finish(outcome.clone());
      outcome
   }

   /// Finds the call in flight for `key`, or registers a new one.
   ///
   /// The shared lock handles the common "already running" case without
   /// serializing lookups. On a miss the exclusive lock is taken and the map is
   /// checked again, since another caller may have registered in between.
   fn acquire<Q>(&self, key: &Q) -> Role<T, E>
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ShardKey + ToOwned<Owned = K> + ?Sized,
   {
      let shard = self.shard(key);

      let existing = shard.calls.read().get(key).cloned();
      if let Some(call) = existing {
         trace!("joining in-flight call");
         return Role::Waiter(call);
      }

      let mut calls = shard.calls.write();
      if let Some(call) = calls.get(key) {
         trace!("call registered concurrently, joining");
         return Role::Waiter(Arc::clone(call));
      }
      let call = Arc::new(Call::new());
      calls.insert(key.to_owned(), Arc::clone(&call));
      drop(calls);

      trace!("registered as owner");
      Role::Owner(call)
   }

   fn join(call: &Call<T, E>, deadline: Option<Instant>) -> Outcome<T, E>
   where
      T: Clone,
      E: Clone,
   {
      match deadline {
         Some(deadline) => {
            if !call.wait_deadline(deadline) {
               debug!("deadline passed while waiting, leaving flight");
               return Err(FlightError::DeadlineExceeded);
            }
         }
         None => call.wait(),
      }
      trace!("joined outcome");
      Self::read(call)
   }

   #[inline]
   fn read(call: &Call<T, E>) -> Outcome<T, E>
   where
      T: Clone,
      E: Clone,
   {
      // Owners release on every exit path, so a woken waiter always finds an
      // outcome. Treat anything else as an abandoned flight.
      call.outcome().cloned().unwrap_or(Err(FlightError::Abandoned))
   }
}

/// Owner-side handle on a registered call.
///
/// [`finish`](OwnerGuard::finish) publishes the outcome and unregisters the
/// key. If the guard is dropped without finishing (the owner unwound, or its
/// task was torn down), waiters receive [`FlightError::Abandoned`] instead of
/// blocking forever.
struct OwnerGuard<T, E, K>
where
   K: Hash + Eq + ShardKey,
{
   group: Group<T, E, K>,
   /// Shard the call was registered in, as routed by the lookup key.
   shard: usize,
   key: K,
   call: Arc<Call<T, E>>,
   finished: bool,
}

impl<T, E, K> OwnerGuard<T, E, K>
where
   K: Hash + Eq + ShardKey,
{
   #[inline]
   fn new(group: Group<T, E, K>, shard: usize, key: K, call: Arc<Call<T, E>>) -> Self {
      Self {
         group,
         shard,
         key,
         call,
         finished: false,
      }
   }

   /// Publishes `outcome` to every waiter, then unregisters the key.
   fn finish(mut self, outcome: Outcome<T, E>) {
      self.complete(outcome);
      self.finished = true;
   }

   fn complete(&self, outcome: Outcome<T, E>) {
      self.call.release(outcome);
      trace!("outcome released");

      // Only the owner removes its key, and nobody can register the key again
      // while this record is in the map, so the entry is ours. The shard comes
      // from registration, not from rehashing the owned key.
      self.group.inner.shards[self.shard]
         .calls
         .write()
         .remove(&self.key);
      trace!("call unregistered");
   }
}

impl<T, E, K> Drop for OwnerGuard<T, E, K>
where
   K: Hash + Eq + ShardKey,
{
   fn drop(&mut self) {
      if !self.finished {
         warn!("owner exited without an outcome, abandoning call");
         self.complete(Err(FlightError::Abandoned));
      }
   }
}

// --- Trait Implementations ---

impl<T, E, K> Clone for Group<T, E, K> {
   /// Returns another handle to the same registry.
   #[inline]
   fn clone(&self) -> Self {
      Self {
         inner: Arc::clone(&self.inner),
      }
   }
}

impl<T, E, K> Default for Group<T, E, K>
where
   K: Hash + Eq + ShardKey,
{
   /// Creates a group with [`DEFAULT_SHARDS`] shards.
   #[inline]
   fn default() -> Self {
      Self::new()
   }
}

impl<T, E, K> fmt::Debug for Group<T, E, K>
where
   K: Hash + Eq + ShardKey,
{
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Group")
         .field("shards", &self.shard_count())
         .field("in_flight", &self.in_flight())
         .finish()
   }
}
