use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use shardflight::Group;

static LOADS: AtomicUsize = AtomicUsize::new(0);

fn load_from_db(key: &str) -> Result<String, String> {
   LOADS.fetch_add(1, Ordering::Relaxed);
   println!("Loading data for key: {key}");
   // Simulate I/O latency
   thread::sleep(Duration::from_millis(100));
   Ok(format!("data_of_{key}"))
}

fn main() {
   let group: Group<String, String> = Group::new();

   let threads: Vec<_> = (0..5)
      .map(|_| {
         let group = group.clone();
         thread::spawn(move || match group.execute("user:123", load_from_db) {
            Ok(data) => println!("Got: {data}"),
            Err(e) => println!("Error: {e}"),
         })
      })
      .collect();

   for t in threads {
      t.join().unwrap();
   }

   println!("Loads performed: {}", LOADS.load(Ordering::Relaxed));
   assert_eq!(group.in_flight(), 0); // Nothing is kept after the flight lands
}
