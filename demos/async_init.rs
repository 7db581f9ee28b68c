use std::sync::atomic::{AtomicUsize, Ordering};

use shardflight::Group;
use tokio::time::{sleep, timeout, Duration};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

async fn fetch_profile(key: String) -> Result<String, String> {
   COUNTER.fetch_add(1, Ordering::Relaxed);
   println!("Fetching {key}...");
   sleep(Duration::from_millis(50)).await;
   Ok(format!("profile of {key}"))
}

#[tokio::main]
async fn main() {
   let group: Group<String, String> = Group::new();

   let tasks: Vec<_> = (0..5)
      .map(|_| {
         let group = group.clone();
         tokio::spawn(async move {
            let profile = group.execute_async("user:42".to_string(), fetch_profile).await;
            println!("Task access: {profile:?}");
         })
      })
      .collect();

   for t in tasks {
      t.await.unwrap();
   }

   // An impatient caller gives up on its own; the fetch still completes.
   let impatient = timeout(
      Duration::from_millis(10),
      group.execute_async("user:7".to_string(), fetch_profile),
   )
   .await;
   println!("Impatient caller timed out: {}", impatient.is_err());

   sleep(Duration::from_millis(100)).await;
   assert_eq!(group.in_flight(), 0);
   println!("Fetches performed: {}", COUNTER.load(Ordering::Relaxed));
}
