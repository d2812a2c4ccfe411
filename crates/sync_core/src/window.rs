//! Sequence-id window arithmetic for remote message pulls.

use shared::protocol::{PullDirection, SequenceRange};

/// Next window to request, or `None` when the remote log has nothing beyond what is
/// loaded in `direction`.
///
/// `read_boundary` is the last sequence id treated as read before anything was
/// loaded. Every returned window lies inside `remote` and is adjacent to `loaded`.
pub fn compute_window(
    remote: Option<SequenceRange>,
    loaded: Option<SequenceRange>,
    read_boundary: Option<i64>,
    direction: PullDirection,
    max_len: i64,
) -> Option<SequenceRange> {
    let remote = remote?;
    let max_len = max_len.max(1);

    let window = match (direction, loaded) {
        (PullDirection::Newer, None) => {
            let start = match read_boundary {
                Some(boundary) if remote.end - boundary >= max_len => {
                    (boundary + 1).max(remote.start)
                }
                _ => (remote.end - max_len + 1).max(remote.start),
            };
            SequenceRange::new(start, (start + max_len - 1).min(remote.end))?
        }
        (PullDirection::Newer, Some(loaded)) => {
            let start = (loaded.end + 1).max(remote.start);
            SequenceRange::new(start, (start + max_len - 1).min(remote.end))?
        }
        (PullDirection::Older, loaded) => {
            let end = loaded
                .map(|loaded| loaded.start - 1)
                .unwrap_or(remote.end)
                .min(remote.end);
            SequenceRange::new((end - max_len + 1).max(remote.start), end)?
        }
    };

    match loaded {
        Some(loaded) if loaded.covers(&window) => None,
        _ => Some(window),
    }
}

#[cfg(test)]
#[path = "tests/window_tests.rs"]
mod tests;
