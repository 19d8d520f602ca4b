//! Majority quorum threshold over a node's neighborhood.
//!
//! A node counts itself as one seat next to its neighbors, so the
//! neighborhood has `n + 1` seats and a quorum is half of them, rounded up:
//!
//! - 0 neighbors → 1 required
//! - n neighbors → ceil((n + 1) / 2) required
//!
//! Partitioning a node away from its neighbors shrinks the neighborhood and
//! with it the threshold, down to the trivially reachable 1.

/// Calculate the quorum threshold for a node with `neighbors` neighbors.
///
/// Formula: ceil((n + 1) / 2)
///
/// # Examples
///
/// ```
/// use quorum_consensus::quorum_threshold;
///
/// assert_eq!(quorum_threshold(0), 1); // Alone - any single vote
/// assert_eq!(quorum_threshold(2), 2); // 2 of 3 seats
/// assert_eq!(quorum_threshold(4), 3); // 3 of 5 seats
/// ```
pub const fn quorum_threshold(neighbors: usize) -> usize {
    // ceil((n + 1) / 2) = (n + 1 + 1) / 2
    (neighbors + 2) / 2
}

/// Check if a voter count meets the threshold.
pub const fn meets_quorum(voters: usize, neighbors: usize) -> bool {
    voters >= quorum_threshold(neighbors)
}

/// Calculate how many more distinct voters are needed to meet the threshold.
pub const fn votes_needed(voters: usize, neighbors: usize) -> usize {
    let threshold = quorum_threshold(neighbors);
    if voters >= threshold {
        0
    } else {
        threshold - voters
    }
}
