use std::future::Future;

use futures::stream::{self, StreamExt};

/// Apply `op` to every item with at most `limit` in flight, returning one
/// result per item in input order whatever order they complete in.
///
/// There is no cancellation: once started, each operation runs to the end,
/// and a failure in one does not stop the others.
pub async fn map_concurrent<'a, T, R, F, Fut>(items: &'a [T], limit: usize, op: F) -> Vec<R>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = R> + 'a,
{
    let mut slots: Vec<Option<R>> = Vec::with_capacity(items.len());
    slots.resize_with(items.len(), || None);

    let op = &op;
    let mut completed = stream::iter(items.iter().enumerate())
        .map(|(index, item)| async move { (index, op(item).await) })
        .buffer_unordered(limit.max(1));

    while let Some((index, result)) = completed.next().await {
        slots[index] = Some(result);
    }

    slots.into_iter().flatten().collect()
}
