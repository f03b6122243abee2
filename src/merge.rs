use crate::domain::{RecordsPage, ShardBatch};

/// Interleaves shard batches round-robin until `limit` items are taken.
///
/// `count` is the cluster-wide total and is never truncated by `limit`.
/// Exhausted batches are skipped; the output depends only on batch order.
pub fn merge(batches: Vec<ShardBatch>, limit: usize) -> RecordsPage {
    let count = batches
        .iter()
        .map(|b| b.count)
        .fold(0u64, u64::saturating_add);

    let mut cursors: Vec<_> = batches.into_iter().map(|b| b.items.into_iter()).collect();
    let mut items = Vec::with_capacity(limit.min(cursors.iter().map(|c| c.len()).sum()));

    'rounds: while items.len() < limit {
        let mut progressed = false;
        for cursor in cursors.iter_mut() {
            if items.len() >= limit {
                break 'rounds;
            }
            if let Some(item) = cursor.next() {
                items.push(item);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    RecordsPage { count, items }
}
