//! Concurrent subscriber invocation with registration-order selection
//!
//! Used by both the dispatch and the forwarding pipeline so handler and
//! filter fan-out pick their winner the same way.

use futures_util::future::{join_all, BoxFuture};
use tokio::task::JoinError;

use crate::cancel::CancelSignal;

/// How one subscriber invocation ended
#[derive(Debug)]
pub enum Invocation<T> {
    Completed(T),
    Panicked(String),
}

/// Fan-out stopped by the cancellation signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutCancelled;

/// Run every future on its own task and wait for all of them.
///
/// Results come back in input order. A panicking subscriber becomes
/// `Invocation::Panicked` without disturbing the others. On cancellation the
/// outstanding tasks are aborted.
pub async fn invoke_all<T: Send + 'static>(
    futures: Vec<BoxFuture<'static, T>>,
    cancel: &CancelSignal,
) -> Result<Vec<Invocation<T>>, FanOutCancelled> {
    if cancel.is_cancelled() {
        return Err(FanOutCancelled);
    }

    let handles: Vec<_> = futures.into_iter().map(tokio::spawn).collect();
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

    tokio::select! {
        results = join_all(handles) => {
            Ok(results
                .into_iter()
                .map(|r| match r {
                    Ok(value) => Invocation::Completed(value),
                    Err(e) => Invocation::Panicked(join_error_message(e)),
                })
                .collect())
        }
        _ = cancel.cancelled() => {
            for abort in aborts {
                abort.abort();
            }
            Err(FanOutCancelled)
        }
    }
}

/// First present slot by position, with its index
pub fn select_first<T>(slots: Vec<Option<T>>) -> Option<(usize, T)> {
    slots
        .into_iter()
        .enumerate()
        .find_map(|(idx, slot)| slot.map(|value| (idx, value)))
}

fn join_error_message(e: JoinError) -> String {
    if e.is_cancelled() {
        return "task cancelled".to_string();
    }
    let panic = e.into_panic();
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use futures_util::FutureExt;
    use std::time::Duration;

    #[test]
    fn test_select_first_by_position() {
        assert_eq!(select_first(vec![None, Some("b"), Some("c")]), Some((1, "b")));
        assert_eq!(select_first::<u8>(vec![None, None]), None);
        assert_eq!(select_first::<u8>(vec![]), None);
    }

    #[tokio::test]
    async fn test_results_in_input_order() {
        let futures = vec![
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                1
            }
            .boxed(),
            async { 2 }.boxed(),
        ];

        let results = invoke_all(futures, &CancelSignal::never()).await.unwrap();
        let values: Vec<i32> = results
            .into_iter()
            .map(|r| match r {
                Invocation::Completed(v) => v,
                Invocation::Panicked(_) => -1,
            })
            .collect();
        assert_eq!(values, vec![1, 2]);
    }

    fn explode() -> i32 {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let futures: Vec<BoxFuture<'static, i32>> = vec![
            async { explode() }.boxed(),
            async { 7 }.boxed(),
        ];

        let results = invoke_all(futures, &CancelSignal::never()).await.unwrap();
        assert!(matches!(&results[0], Invocation::Panicked(msg) if msg == "boom"));
        assert!(matches!(results[1], Invocation::Completed(7)));
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let (handle, signal) = cancel_pair();
        let futures = vec![std::future::pending::<i32>().boxed()];

        let run = tokio::spawn(async move { invoke_all(futures, &signal).await });
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), FanOutCancelled);
    }
}
