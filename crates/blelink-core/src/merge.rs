//! Merge strategies for overlapping sample windows.
//!
//! A device exposes a rolling window of its most recent samples, so two
//! consecutive reads usually overlap. A [`WindowMerge`] folds the newest
//! window into the aggregate built so far.
//!
//! The contract every strategy must honour: the returned buffer starts with
//! `aggregated` unchanged. A strategy may append, or return `aggregated`
//! as-is, but never rewrites history that has already been emitted. The
//! streaming loop rejects results that shrink the buffer.

use blelink_types::SampleWindow;

/// Folds a freshly read window into the aggregate.
///
/// Any `Fn(Vec<u16>, &SampleWindow, &SampleWindow) -> Vec<u16>` closure is a
/// `WindowMerge`.
///
/// # Example
///
/// ```
/// use blelink_core::merge::WindowMerge;
/// use blelink_types::SampleWindow;
///
/// // Append every window whole, ignoring overlap.
/// let append_all = |mut aggregated: Vec<u16>, _prev: &SampleWindow, cur: &SampleWindow| {
///     aggregated.extend_from_slice(cur.as_slice());
///     aggregated
/// };
///
/// let window = SampleWindow::from([1u16; 64]);
/// let merged = append_all.merge(vec![7], &window, &window);
/// assert_eq!(merged.len(), 65);
/// ```
pub trait WindowMerge: Send + Sync {
    /// Return the aggregate after seeing `current`, given the window read
    /// just before it.
    fn merge(&self, aggregated: Vec<u16>, previous: &SampleWindow, current: &SampleWindow) -> Vec<u16>;
}

impl<F> WindowMerge for F
where
    F: Fn(Vec<u16>, &SampleWindow, &SampleWindow) -> Vec<u16> + Send + Sync,
{
    fn merge(&self, aggregated: Vec<u16>, previous: &SampleWindow, current: &SampleWindow) -> Vec<u16> {
        self(aggregated, previous, current)
    }
}

/// Appends the part of each window not already covered by the previous one.
///
/// The overlap is the smallest shift at which the previous window's tail
/// equals the current window's head. A shift of zero (identical windows)
/// appends nothing. When no shift lines up the device is assumed to have
/// reset or skipped ahead, and the whole current window is appended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlapMerge;

impl OverlapMerge {
    /// Create the merge strategy.
    pub fn new() -> Self {
        Self
    }

    /// The samples of `current` not present at the end of `previous`.
    pub fn unseen_tail<'a>(previous: &SampleWindow, current: &'a SampleWindow) -> &'a [u16] {
        let prev = previous.as_slice();
        let cur = current.as_slice();
        let len = cur.len();

        (0..len)
            .find(|&shift| prev[shift..] == cur[..len - shift])
            .map_or(cur, |shift| &cur[len - shift..])
    }
}

impl WindowMerge for OverlapMerge {
    fn merge(&self, mut aggregated: Vec<u16>, previous: &SampleWindow, current: &SampleWindow) -> Vec<u16> {
        aggregated.extend_from_slice(Self::unseen_tail(previous, current));
        aggregated
    }
}
