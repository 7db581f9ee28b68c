use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shardflight::{FlightError, Group};

#[derive(Debug)]
struct BackendDown;

impl std::fmt::Display for BackendDown {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.write_str("backend unavailable")
   }
}

impl std::error::Error for BackendDown {}

fn main() {
   // Errors are shared by reference, so wrap non-Clone errors in an Arc.
   let group: Group<u32, Arc<BackendDown>> = Group::with_shards(16);

   let threads: Vec<_> = (0..3)
      .map(|_| {
         let group = group.clone();
         thread::spawn(move || {
            group.execute("inventory", |key| {
               println!("Attempting load of {key}...");
               thread::sleep(Duration::from_millis(50));
               Err(Arc::new(BackendDown))
            })
         })
      })
      .collect();

   for t in threads {
      match t.join().unwrap() {
         Ok(_) => panic!("Should have failed"),
         Err(e) => println!("Caught error: {e}"),
      }
   }

   // The failure was not cached: the next call does fresh work.
   let recovered = group.execute("inventory", |_| Ok(42));
   println!("After recovery: {recovered:?}");
   assert_eq!(recovered.ok(), Some(42));

   // A panicking load reaches callers as an error instead of hanging them.
   let crashed = group.execute("inventory", |_| -> Result<u32, Arc<BackendDown>> {
      panic!("driver crashed")
   });
   match crashed {
      Err(FlightError::Panicked(message)) => println!("Recovered panic: {message}"),
      other => panic!("Expected a panic outcome, got {other:?}"),
   }
}
