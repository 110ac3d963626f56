use leaselock::{
    test_utils::FlakyStore, CancellationToken, Error, LeaseLock, LockOptions, MemoryStore,
    StalenessPolicy,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("leaselock demo");
    println!("==============\n");

    demo_competing_workers().await?;
    demo_lost_lease().await?;

    println!("\nall demos completed");
    Ok(())
}

/// Several workers race for the same job key; only one runs at a time.
async fn demo_competing_workers() -> Result<(), Box<dyn std::error::Error>> {
    println!("1. competing workers on one key");

    let store = Arc::new(MemoryStore::new());
    let running = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::new();

    for id in 0..4 {
        let lock = LeaseLock::new(store.clone())
            .with_options(LockOptions::default().with_retry_interval(Duration::from_millis(20)));
        let running = running.clone();
        workers.push(tokio::spawn(async move {
            lock.in_lock("nightly-report", Duration::from_secs(2), |_ctx| async move {
                let concurrent = running.fetch_add(1, Ordering::SeqCst) + 1;
                println!("   worker {id} running (concurrent holders: {concurrent})");
                sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, Error>(id)
            })
            .await
        }));
    }

    for worker in workers {
        worker.await??;
    }
    Ok(())
}

/// The store becomes unreachable mid-job; the watchdog gives up after one
/// TTL and the job sees its token cancelled.
async fn demo_lost_lease() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n2. store partition during a job");

    let flaky = Arc::new(FlakyStore::new(Arc::new(MemoryStore::new())));
    let lock = LeaseLock::new(flaky.clone()).with_options(
        LockOptions::default()
            .with_timeout(Duration::from_millis(200))
            .with_staleness(StalenessPolicy::BoundedByTtl),
    );

    let outcome = lock
        .in_lock("reindex", Duration::from_secs(1), |ctx: CancellationToken| async move {
            flaky.set_reachable(false);
            tokio::select! {
                () = ctx.cancelled() => Ok::<_, Error>("stopped: lease lost"),
                () = sleep(Duration::from_secs(5)) => Ok("finished"),
            }
        })
        .await?;

    println!("   job outcome: {outcome}");
    Ok(())
}
