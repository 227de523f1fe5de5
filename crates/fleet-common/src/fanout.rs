//! Scatter-gather over a set of targets.
//!
//! Every per-target future runs concurrently and all of them are joined
//! before the caller sees any result, so a step never observes a partial
//! fan-out.

use std::future::Future;

use futures::future::join_all;

use crate::Error;

/// Result of one fanned-out call, tagged with its target
#[derive(Debug)]
pub struct Gathered<T> {
    /// Target name (usually the cluster name)
    pub target: String,
    /// What the call returned
    pub result: Result<T, Error>,
}

/// Run `f` once per target concurrently and collect every outcome.
///
/// Results come back in target order.
pub async fn scatter_gather<I, F, Fut, T>(targets: I, f: F) -> Vec<Gathered<T>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let names: Vec<String> = targets
        .into_iter()
        .map(|t| t.as_ref().to_string())
        .collect();
    let results = join_all(names.iter().cloned().map(&f)).await;
    names
        .into_iter()
        .zip(results)
        .map(|(target, result)| Gathered { target, result })
        .collect()
}

/// Split gathered results into successes and `(target, error)` failures.
pub fn partition<T>(gathered: Vec<Gathered<T>>) -> (Vec<(String, T)>, Vec<(String, Error)>) {
    let mut ok = Vec::new();
    let mut failed = Vec::new();
    for g in gathered {
        match g.result {
            Ok(v) => ok.push((g.target, v)),
            Err(e) => failed.push((g.target, e)),
        }
    }
    (ok, failed)
}

/// Fold per-target failures into one error naming every failed target.
///
/// Returns `None` when nothing failed.
pub fn combine_errors(context: &str, failed: &[(String, Error)]) -> Option<Error> {
    if failed.is_empty() {
        return None;
    }
    let message = failed
        .iter()
        .map(|(target, e)| format!("{}: {}", target, e))
        .collect::<Vec<_>>()
        .join("; ");
    Some(Error::internal_with_context(context, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Story: Three clusters are queried concurrently; the slowest one does
    /// not hold back the others, and results keep the caller's order.
    #[tokio::test]
    async fn story_results_are_joined_in_target_order() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let gathered = scatter_gather(["a", "b", "c"], |name| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let delay = if name == "a" { 20 } else { 1 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, Error>(name.to_uppercase())
            }
        })
        .await;

        let targets: Vec<_> = gathered.iter().map(|g| g.target.as_str()).collect();
        assert_eq!(targets, vec!["a", "b", "c"]);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(gathered[0].result.as_ref().ok(), Some(&"A".to_string()));
    }

    #[tokio::test]
    async fn failures_are_partitioned_and_combined() {
        let gathered = scatter_gather(vec!["east".to_string(), "west".to_string()], |name| async move {
            if name == "west" {
                Err(Error::ClusterDisconnected { cluster: name })
            } else {
                Ok(1)
            }
        })
        .await;

        let (ok, failed) = partition(gathered);
        assert_eq!(ok, vec![("east".to_string(), 1)]);
        assert_eq!(failed.len(), 1);

        let err = combine_errors("apply_spec", &failed).expect("one failure");
        assert!(err.to_string().contains("west: cluster west disconnected"));
        assert!(combine_errors("apply_spec", &[]).is_none());
    }
}
