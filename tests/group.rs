use std::borrow::Borrow;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use shardflight::{ConfigError, FlightError, Group, ShardKey, DEFAULT_SHARDS};

/// A latch the computation blocks on until the test opens it.
#[derive(Clone, Default)]
struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
   fn wait(&self) {
      let (open, cvar) = &*self.0;
      let mut open = open.lock().unwrap();
      while !*open {
         open = cvar.wait(open).unwrap();
      }
   }

   fn open(&self) {
      let (open, cvar) = &*self.0;
      *open.lock().unwrap() = true;
      cvar.notify_all();
   }
}

/// Spins until `counter` reaches `n`, then gives stragglers a moment to get
/// from the counter into `execute`.
fn wait_for_arrivals(counter: &AtomicUsize, n: usize) {
   while counter.load(Ordering::SeqCst) < n {
      thread::yield_now();
   }
   thread::sleep(Duration::from_millis(100));
}

#[test]
fn test_execute_returns_value() {
   let group: Group<i32, &str> = Group::new();
   let key = "test-key";

   let result = group.execute(key, |k| {
      assert_eq!(k, key);
      Ok(42)
   });

   assert_eq!(result, Ok(42));
   assert_eq!(group.in_flight(), 0);
}

#[test]
fn test_concurrent_callers_share_one_execution() {
   const N: usize = 256;
   let group: Group<String, ()> = Group::new();
   let gate = Gate::default();
   let calls = Arc::new(AtomicUsize::new(0));
   let arrived = Arc::new(AtomicUsize::new(0));

   let threads: Vec<_> = (0..N)
      .map(|_| {
         let group = group.clone();
         let gate = gate.clone();
         let calls = Arc::clone(&calls);
         let arrived = Arc::clone(&arrived);
         thread::spawn(move || {
            arrived.fetch_add(1, Ordering::SeqCst);
            group.execute("key", |_| {
               calls.fetch_add(1, Ordering::SeqCst);
               gate.wait();
               Ok("value".to_string())
            })
         })
      })
      .collect();

   wait_for_arrivals(&arrived, N);
   assert!(group.is_in_flight("key"));
   gate.open();

   for handle in threads {
      assert_eq!(handle.join().unwrap(), Ok("value".to_string()));
   }
   assert_eq!(calls.load(Ordering::SeqCst), 1);
   assert!(!group.is_in_flight("key"));
}

#[test]
fn test_error_reaches_every_caller() {
   const N: usize = 5;
   let group: Group<i32, Arc<io::Error>> = Group::new();
   let expected = Arc::new(io::Error::new(io::ErrorKind::Other, "simulated error"));
   let calls = Arc::new(AtomicUsize::new(0));
   let barrier = Arc::new(Barrier::new(N));

   let threads: Vec<_> = (0..N)
      .map(|_| {
         let group = group.clone();
         let expected = Arc::clone(&expected);
         let calls = Arc::clone(&calls);
         let barrier = Arc::clone(&barrier);
         thread::spawn(move || {
            barrier.wait();
            group.execute("error-key", |_| {
               calls.fetch_add(1, Ordering::SeqCst);
               thread::sleep(Duration::from_millis(300));
               Err(expected)
            })
         })
      })
      .collect();

   for handle in threads {
      let err = handle.join().unwrap().unwrap_err();
      let inner = err.failed().expect("computation error expected");
      // Same error object, not merely an equal message.
      assert!(Arc::ptr_eq(inner, &expected));
      assert_eq!(err.to_string(), "simulated error");
   }
   assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_distinct_keys_run_independently() {
   let group: Group<i32, ()> = Group::new();
   let expected: HashMap<&str, i32> = [("key1", 1), ("key2", 2), ("key3", 3)].into();
   let call_log = Arc::new(Mutex::new(HashMap::<String, usize>::new()));

   let threads: Vec<_> = expected
      .iter()
      .map(|(&key, &value)| {
         let group = group.clone();
         let call_log = Arc::clone(&call_log);
         thread::spawn(move || {
            let result = group.execute(key, |k| {
               *call_log.lock().unwrap().entry(k.to_string()).or_default() += 1;
               Ok(value)
            });
            (key, result)
         })
      })
      .collect();

   for handle in threads {
      let (key, result) = handle.join().unwrap();
      assert_eq!(result, Ok(expected[key]));
   }
   let call_log = call_log.lock().unwrap();
   for key in expected.keys() {
      assert_eq!(call_log.get(*key), Some(&1), "key {key}");
   }
}

#[test]
fn test_distinct_keys_do_not_block_each_other() {
   // One shard, so both keys share a lock.
   let group: Group<&'static str, ()> = Group::with_shards(1);
   let gate = Gate::default();

   let slow = {
      let group = group.clone();
      let gate = gate.clone();
      thread::spawn(move || {
         group.execute("slow", |_| {
            gate.wait();
            Ok("slow")
         })
      })
   };

   while !group.is_in_flight("slow") {
      thread::yield_now();
   }
   // Completes while "slow" is still blocked.
   assert_eq!(group.execute("fast", |_| Ok("fast")), Ok("fast"));
   assert!(group.is_in_flight("slow"));

   gate.open();
   assert_eq!(slow.join().unwrap(), Ok("slow"));
}

#[test]
fn test_no_caching_after_completion() {
   let group: Group<usize, ()> = Group::new();
   let calls = AtomicUsize::new(0);

   for expected in 1..=3 {
      let result = group.execute("key", |_| Ok(calls.fetch_add(1, Ordering::SeqCst) + 1));
      assert_eq!(result, Ok(expected));
      assert!(!group.is_in_flight("key"));
   }
   assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_default_shard_count() {
   let group: Group<i32, ()> = Group::new();
   assert_eq!(group.shard_count(), DEFAULT_SHARDS);
   assert_eq!(DEFAULT_SHARDS, 256);

   let zero: Group<i32, ()> = Group::with_shards(0);
   assert_eq!(zero.shard_count(), DEFAULT_SHARDS);

   let default: Group<i32, ()> = Group::default();
   assert_eq!(default.shard_count(), DEFAULT_SHARDS);
}

#[test]
fn test_custom_shard_count() {
   for n in [1, 2, 4, 16, 256] {
      let group: Group<i32, ()> = Group::with_shards(n);
      assert_eq!(group.shard_count(), n);
      assert_eq!(group.execute("test", |_| Ok(999)), Ok(999));
   }
}

#[test]
fn test_try_with_shards_rejects_non_power_of_two() {
   for n in [3, 5, 10, 100] {
      let result = Group::<i32, ()>::try_with_shards(n);
      assert_eq!(result.err(), Some(ConfigError::NotPowerOfTwo(n)));
   }
   assert!(Group::<i32, ()>::try_with_shards(64).is_ok());
}

#[test]
#[should_panic(expected = "shard count must be a power of two, got 10")]
fn test_with_shards_panics_on_non_power_of_two() {
   let _ = Group::<i32, ()>::with_shards(10);
}

#[test]
fn test_shard_index_is_stable() {
   let group: Group<i32, ()> = Group::with_shards(16);
   let index = group.shard_index("user:123");
   assert!(index < 16);
   for _ in 0..10 {
      assert_eq!(group.shard_index("user:123"), index);
   }
   assert_eq!(group.shard_index(&String::from("user:123")), index);
}

#[test]
fn test_numeric_keys() {
   let group: Group<u64, (), u64> = Group::with_shards(4);
   assert_eq!(group.shard_index(&6u64), 2);
   assert_eq!(group.execute(&6u64, |k| Ok(k * 7)), Ok(42));
   assert!(!group.is_in_flight(&6u64));
}

/// Borrowed lookup form of [`OwnedKey`]. Deliberately routed to a different
/// shard than its owned form.
#[derive(Debug, PartialEq, Eq, Hash)]
struct LookupKey {
   id: u64,
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct OwnedKey(LookupKey);

impl Borrow<LookupKey> for OwnedKey {
   fn borrow(&self) -> &LookupKey {
      &self.0
   }
}

impl ToOwned for LookupKey {
   type Owned = OwnedKey;

   fn to_owned(&self) -> OwnedKey {
      OwnedKey(LookupKey { id: self.id })
   }
}

impl ShardKey for LookupKey {
   fn shard_hash(&self) -> u64 {
      self.id
   }
}

impl ShardKey for OwnedKey {
   fn shard_hash(&self) -> u64 {
      self.0.id + 1
   }
}

#[test]
fn test_record_removed_from_the_shard_it_was_registered_in() {
   let group: Group<u64, (), OwnedKey> = Group::with_shards(2);
   let key = LookupKey { id: 0 };
   assert_ne!(group.shard_index(&key), group.shard_index(&key.to_owned()));

   assert_eq!(group.execute(&key, |k| Ok(k.id + 10)), Ok(10));
   assert!(!group.is_in_flight(&key));
   assert_eq!(group.in_flight(), 0);

   // The key is free for the next flight.
   assert_eq!(group.execute(&key, |k| Ok(k.id + 20)), Ok(20));
   assert_eq!(group.in_flight(), 0);
}

#[test]
fn test_one_shard_many_keys_register_once() {
   const THREADS: usize = 32;
   const ROUNDS: usize = 50;
   const KEYS: [&str; 2] = ["key-a", "key-b"];

   // Every key contends for the same lock.
   let group: Group<usize, (), String> = Group::with_shards(1);

   for round in 0..ROUNDS {
      let gate = Gate::default();
      let calls: Arc<[AtomicUsize; 2]> = Arc::new(Default::default());
      let arrived = Arc::new(AtomicUsize::new(0));
      let threads: Vec<_> = (0..THREADS)
         .map(|i| {
            let group = group.clone();
            let gate = gate.clone();
            let calls = Arc::clone(&calls);
            let arrived = Arc::clone(&arrived);
            thread::spawn(move || {
               let slot = i % KEYS.len();
               arrived.fetch_add(1, Ordering::SeqCst);
               group.execute(KEYS[slot], |_| {
                  calls[slot].fetch_add(1, Ordering::SeqCst);
                  gate.wait();
                  Ok(round)
               })
            })
         })
         .collect();

      wait_for_arrivals(&arrived, THREADS);
      assert_eq!(group.in_flight(), KEYS.len(), "round {round}");
      gate.open();

      for handle in threads {
         assert_eq!(handle.join().unwrap(), Ok(round));
      }
      for (slot, key) in KEYS.iter().enumerate() {
         assert_eq!(calls[slot].load(Ordering::SeqCst), 1, "round {round}, {key}");
      }
      assert_eq!(group.in_flight(), 0, "round {round}");
   }
}

#[test]
fn test_panic_becomes_error_for_every_caller() {
   const N: usize = 4;
   let group: Group<i32, ()> = Group::new();
   let barrier = Arc::new(Barrier::new(N));

   let threads: Vec<_> = (0..N)
      .map(|_| {
         let group = group.clone();
         let barrier = Arc::clone(&barrier);
         thread::spawn(move || {
            barrier.wait();
            group.execute("boom", |_| {
               thread::sleep(Duration::from_millis(100));
               panic!("kaboom");
            })
         })
      })
      .collect();

   for handle in threads {
      let err = handle.join().unwrap().unwrap_err();
      assert_eq!(err, FlightError::Panicked("kaboom".to_string()));
      assert!(err.is_panic());
   }

   // The key is free again.
   assert!(!group.is_in_flight("boom"));
   assert_eq!(group.execute("boom", |_| Ok(1)), Ok(1));
}

#[test]
fn test_deadline_only_affects_the_waiting_caller() {
   let group: Group<&'static str, ()> = Group::new();
   let gate = Gate::default();
   let calls = Arc::new(AtomicUsize::new(0));

   let owner = {
      let group = group.clone();
      let gate = gate.clone();
      let calls = Arc::clone(&calls);
      thread::spawn(move || {
         group.execute("key", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            gate.wait();
            Ok("value")
         })
      })
   };
   while !group.is_in_flight("key") {
      thread::yield_now();
   }

   let patient = {
      let group = group.clone();
      thread::spawn(move || group.execute("key", |_| Ok("should not run")))
   };

   let started = Instant::now();
   let impatient =
      group.execute_timeout("key", Duration::from_millis(50), |_| Ok("should not run"));
   assert_eq!(impatient, Err(FlightError::DeadlineExceeded));
   assert!(started.elapsed() >= Duration::from_millis(50));
   // Giving up did not disturb the flight.
   assert!(group.is_in_flight("key"));

   gate.open();
   assert_eq!(owner.join().unwrap(), Ok("value"));
   assert_eq!(patient.join().unwrap(), Ok("value"));
   assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_owner_ignores_its_own_deadline() {
   let group: Group<i32, ()> = Group::new();
   let result = group.execute_until("key", Instant::now(), |_| {
      thread::sleep(Duration::from_millis(20));
      Ok(5)
   });
   assert_eq!(result, Ok(5));
}

#[test]
fn test_reentrant_call_for_another_key() {
   // Both keys land in the single shard.
   let group: Group<i32, ()> = Group::with_shards(1);
   let inner_group = group.clone();

   let result = group.execute("outer", |_| {
      let inner = inner_group.execute("inner", |_| Ok(20)).map_err(|_| ())?;
      Ok(inner + 1)
   });

   assert_eq!(result, Ok(21));
   assert_eq!(group.in_flight(), 0);
}

#[test]
fn test_debug_reports_shape() {
   let group: Group<i32, ()> = Group::with_shards(8);
   assert_eq!(format!("{group:?}"), "Group { shards: 8, in_flight: 0 }");
}
