//! Key hashing and shard layout.
//!
//! Keys are spread over a fixed, power-of-two number of shards by masking a
//! 64-bit hash. String and byte keys are hashed with XXH3; integer keys are
//! taken as already hashed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use crate::call::Call;
use crate::error::ConfigError;

/// Shard count used when none (or zero) is requested.
pub const DEFAULT_SHARDS: usize = 256;

/// 64-bit XXH3 of `bytes`.
#[inline]
pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
   xxh3_64(bytes)
}

/// A key that can be routed to a shard.
///
/// The hash only has to be deterministic and well spread; it is never used for
/// anything security related.
///
/// An owned key and every borrowed form it is looked up by must return the same
/// `shard_hash`, the same way `Borrow` demands matching `Hash` and `Eq`.
/// Otherwise lookups by the borrowed form go to a different shard than the
/// record.
pub trait ShardKey {
   /// Returns the 64-bit hash used to pick this key's shard.
   fn shard_hash(&self) -> u64;
}

impl ShardKey for str {
   #[inline]
   fn shard_hash(&self) -> u64 {
      hash_bytes(self.as_bytes())
   }
}

impl ShardKey for String {
   #[inline]
   fn shard_hash(&self) -> u64 {
      self.as_str().shard_hash()
   }
}

impl ShardKey for [u8] {
   #[inline]
   fn shard_hash(&self) -> u64 {
      hash_bytes(self)
   }
}

impl ShardKey for Vec<u8> {
   #[inline]
   fn shard_hash(&self) -> u64 {
      hash_bytes(self)
   }
}

impl<Q: ShardKey + ?Sized> ShardKey for &Q {
   #[inline]
   fn shard_hash(&self) -> u64 {
      (**self).shard_hash()
   }
}

macro_rules! prehashed_key {
   ($($ty:ty),*) => {
      $(
         impl ShardKey for $ty {
            #[inline]
            fn shard_hash(&self) -> u64 {
               *self as u64
            }
         }
      )*
   };
}

prehashed_key!(u8, u16, u32, u64, usize, i32, i64);

/// Resolves a requested shard count: zero means [`DEFAULT_SHARDS`], anything
/// else must be a power of two.
#[inline]
pub(crate) fn resolve_shard_count(requested: usize) -> Result<usize, ConfigError> {
   match requested {
      0 => Ok(DEFAULT_SHARDS),
      n if n.is_power_of_two() => Ok(n),
      n => Err(ConfigError::NotPowerOfTwo(n)),
   }
}

/// One partition of the registry: its own lock over its own map.
pub(crate) struct Shard<K, T, E> {
   pub(crate) calls: RwLock<HashMap<K, Arc<Call<T, E>>>>,
}

impl<K, T, E> Shard<K, T, E> {
   pub(crate) fn new() -> Self {
      Self {
         calls: RwLock::new(HashMap::new()),
      }
   }
}
