use std::{future::Future, time::Duration};

use backon::{BackoffBuilder, ConstantBuilder};
use soloist_core::store::StoreUnavailable;
use tokio::{sync::watch, task::JoinHandle};

const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Bound a store call by `timeout`; an overrun counts as the store being
/// unavailable.
pub(crate) async fn timed<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, StoreUnavailable>>,
) -> Result<T, StoreUnavailable> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(elapsed) => Err(StoreUnavailable::new(elapsed)),
    }
}

/// Resolves once `flag` observes `true`. Equivalent to
/// `flag.wait_for(|stopping| *stopping)`, but avoids holding the watch
/// channel's borrow guard across an `.await` point, which would make the
/// surrounding `tokio::select!` future non-`Send`.
pub(crate) async fn until_stopping(flag: &mut watch::Receiver<bool>) {
    loop {
        if *flag.borrow() {
            return;
        }
        if flag.changed().await.is_err() {
            return;
        }
    }
}

/// Run `op` until it succeeds or `budget` transient failures have been
/// retried, with a short jittered constant backoff between attempts.
pub(crate) async fn retry_transient<T, Fut>(
    budget: u32,
    mut op: impl FnMut() -> Fut,
) -> Result<T, StoreUnavailable>
where
    Fut: Future<Output = Result<T, StoreUnavailable>>,
{
    let mut backoff = ConstantBuilder::default()
        .with_delay(RETRY_DELAY)
        .with_max_times(budget as usize)
        .with_jitter()
        .build();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match backoff.next() {
                Some(delay) => {
                    tracing::debug!(error = %err, ?delay, "transient store failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            },
        }
    }
}

/// Wait up to `grace` for a task to finish on its own, then abort it.
pub(crate) async fn join_within(grace: Duration, task: &mut JoinHandle<()>) {
    if tokio::time::timeout(grace, &mut *task).await.is_err() {
        task.abort();
    }
}
