//! Bounded-parallel broadcast.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cairn_types::Snode;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Runs `cb` against every peer, at most `max_parallel` in flight at once.
///
/// Returns the number of peers for which `cb` returned `false`. Failures are
/// counted, never hidden; interpreting the count is the caller's business.
pub async fn bcast<I, F, Fut>(peers: I, max_parallel: usize, cb: F) -> usize
where
    I: IntoIterator<Item = Snode>,
    F: Fn(Snode) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    let sem = Arc::new(Semaphore::new(max_parallel.max(1)));
    let failed = Arc::new(AtomicUsize::new(0));

    let mut tasks = JoinSet::new();
    for peer in peers {
        let sem = Arc::clone(&sem);
        let failed = Arc::clone(&failed);
        let cb = cb.clone();
        tasks.spawn(async move {
            let ok = match sem.acquire().await {
                Ok(_permit) => cb(peer).await,
                Err(_) => false,
            };
            if !ok {
                failed.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
    while tasks.join_next().await.is_some() {}

    failed.load(Ordering::Relaxed)
}
