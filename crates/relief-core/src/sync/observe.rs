//! Helpers for push-based observables built on `tokio::sync::watch`

use tokio::sync::watch;

/// Combine two observables into one emitting the latest pair.
///
/// The combined receiver starts with the current values of both inputs and
/// updates whenever either input changes. The forwarding task ends when both
/// inputs close or every combined receiver is dropped.
pub fn combine_latest<A, B>(
    mut first: watch::Receiver<A>,
    mut second: watch::Receiver<B>,
) -> watch::Receiver<(A, B)>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    B: Clone + PartialEq + Send + Sync + 'static,
{
    let initial = (
        first.borrow_and_update().clone(),
        second.borrow_and_update().clone(),
    );
    let (tx, rx) = watch::channel(initial);

    tokio::spawn(async move {
        let mut first_open = true;
        let mut second_open = true;
        while first_open || second_open {
            tokio::select! {
                changed = first.changed(), if first_open => {
                    if changed.is_err() {
                        first_open = false;
                        continue;
                    }
                }
                changed = second.changed(), if second_open => {
                    if changed.is_err() {
                        second_open = false;
                        continue;
                    }
                }
                () = tx.closed() => break,
            }

            let latest = (first.borrow_and_update().clone(), second.borrow_and_update().clone());
            tx.send_if_modified(|current| {
                if *current == latest {
                    false
                } else {
                    *current = latest;
                    true
                }
            });
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fires_when_either_input_changes() {
        let (syncing_tx, syncing_rx) = watch::channel(false);
        let (pending_tx, pending_rx) = watch::channel(0_usize);
        let mut combined = combine_latest(syncing_rx, pending_rx);
        assert_eq!(*combined.borrow_and_update(), (false, 0));

        syncing_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), combined.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*combined.borrow_and_update(), (true, 0));

        pending_tx.send(3).unwrap();
        tokio::time::timeout(Duration::from_secs(5), combined.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*combined.borrow_and_update(), (true, 3));
    }
}
