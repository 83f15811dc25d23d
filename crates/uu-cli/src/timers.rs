use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use color_eyre::Result;
use tokio::sync::mpsc;
use tracing::info;
use uu_timer::{NamedTimer, Timers, TokioTimerWorker, UserInfo};

const WORKER_NAME: &str = "uu-timer";

static TIMERS: OnceLock<Timers> = OnceLock::new();

/// The process-wide timers, backed by one dedicated worker thread.
pub fn timers() -> Result<&'static Timers> {
    if let Some(timers) = TIMERS.get() {
        return Ok(timers);
    }
    let worker = TokioTimerWorker::spawn(WORKER_NAME)?;
    // A racing initializer may win; its worker is the one kept.
    let _ = TIMERS.set(Timers::new(Arc::new(worker)));
    TIMERS
        .get()
        .ok_or_else(|| color_eyre::eyre::eyre!("timer worker unavailable"))
}

/// Start a repeating timer and wait until it has fired `fires` times.
pub async fn run(timers: &Timers, id: &str, interval: Duration, fires: u32) -> Result<u32> {
    if fires == 0 {
        color_eyre::eyre::bail!("timer {id} needs at least one fire");
    }
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let count = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&count);
    let limit: UserInfo = Arc::new(fires);

    timers.start_timer(
        id,
        interval,
        true,
        Some(limit),
        move |timer: &NamedTimer, user_info: Option<&UserInfo>| {
            let limit = user_info
                .and_then(|info| info.downcast_ref::<u32>())
                .copied()
                .unwrap_or(1);
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            info!(timer_id = timer.id(), fire = n, "timer fired");
            if n >= limit {
                timer.cancel();
                let _ = done_tx.send(n);
            }
        },
    );

    match tokio::time::timeout(wait_budget(interval, fires), done_rx.recv()).await {
        Ok(Some(n)) => Ok(n),
        Ok(None) => color_eyre::eyre::bail!("timer {id} was cancelled early"),
        Err(_) => {
            timers.cancel_active_timer(id);
            color_eyre::eyre::bail!(
                "timer {id} fired {} of {fires} times before timing out",
                count.load(Ordering::SeqCst)
            )
        }
    }
}

/// How long to wait for `fires` fires before giving up; saturates at `Duration::MAX`.
fn wait_budget(interval: Duration, fires: u32) -> Duration {
    interval
        .checked_mul(fires.saturating_add(2))
        .and_then(|total| total.checked_add(Duration::from_secs(1)))
        .unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_until_requested_fire_count() {
        let worker = TokioTimerWorker::spawn("uu-timer-cli-test").expect("spawn worker");
        let timers = Timers::new(Arc::new(worker));

        let fired = run(&timers, "cli", Duration::from_millis(5), 3)
            .await
            .expect("timer should complete");
        assert_eq!(fired, 3);
        assert!(timers.find_active_timer("cli").is_none());
    }

    #[tokio::test]
    async fn zero_fires_is_rejected() {
        let timers = Timers::new(Arc::new(uu_core::timer::ManualTimerWorker::new()));
        assert!(run(&timers, "none", Duration::from_millis(5), 0).await.is_err());
        assert!(timers.list_active_timers().is_empty());
    }

    #[test]
    fn wait_budget_saturates_instead_of_overflowing() {
        assert_eq!(
            wait_budget(Duration::from_millis(10), 3),
            Duration::from_millis(1050)
        );
        assert_eq!(
            wait_budget(Duration::from_millis(10), u32::MAX),
            Duration::from_millis(10) * u32::MAX + Duration::from_secs(1)
        );
        assert_eq!(
            wait_budget(Duration::from_millis(u64::MAX), u32::MAX),
            Duration::MAX
        );
        assert_eq!(wait_budget(Duration::MAX, 1), Duration::MAX);
    }
}
