//! Shutdown signal helpers
//!
//! Shutdown is a `watch::Receiver<bool>` that flips to `true` once. A
//! dropped sender means nobody can request shutdown any more.

use std::time::Duration;
use tokio::sync::watch;

/// Wait until shutdown is requested.
pub(crate) async fn requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleep for `duration`, returning early with `true` if shutdown is requested.
pub(crate) async fn sleep_or_shutdown(
    duration: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = requested(shutdown) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_signal() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(!sleep_or_shutdown(Duration::from_secs(5), &mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_interrupts_sleep() {
        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move { sleep_or_shutdown(Duration::from_secs(60), &mut rx).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        assert!(task.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_never_signals() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(!sleep_or_shutdown(Duration::from_secs(1), &mut rx).await);
    }

    #[tokio::test]
    async fn test_already_requested() {
        let (_tx, mut rx) = watch::channel(true);
        assert!(sleep_or_shutdown(Duration::from_secs(60), &mut rx).await);
    }
}
