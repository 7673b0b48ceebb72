//! Completion listeners for asynchronous replies.
//!
//! When a node implementation answers a request asynchronously, the control
//! context registers a sync point `{ seq, end }`: results tagged `seq` belong
//! to the request, and the `Done` tagged `end` completes it. A sync point fires
//! exactly once and is removed when it does. There is no timeout; teardown
//! cancels whatever is still pending.

/// One pending asynchronous reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPoint<T> {
    /// Sequence number results carry.
    pub seq: u32,
    /// Sequence number of the completing `Done`.
    pub end: u32,
    /// What to do when it completes.
    pub data: T,
}

/// Pending sync points, in registration order.
#[derive(Debug, Clone)]
pub struct SyncPoints<T> {
    pending: Vec<SyncPoint<T>>,
}

impl<T> Default for SyncPoints<T> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
        }
    }
}

impl<T> SyncPoints<T> {
    /// No pending sync points.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the `Done` tagged `end` of request `seq`.
    pub fn register(&mut self, seq: u32, end: u32, data: T) {
        tracing::trace!("sync point {} -> {} registered", seq, end);
        self.pending.push(SyncPoint { seq, end, data });
    }

    /// Listeners that results tagged `seq` belong to.
    pub fn matching(&self, seq: u32) -> impl Iterator<Item = &T> + '_ {
        self.pending
            .iter()
            .filter(move |p| p.seq == seq)
            .map(|p| &p.data)
    }

    /// Remove and return every listener completed by the `Done` tagged `end`.
    pub fn complete(&mut self, end: u32) -> Vec<T> {
        let mut fired = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].end == end {
                fired.push(self.pending.remove(i).data);
            } else {
                i += 1;
            }
        }
        if !fired.is_empty() {
            tracing::trace!("sync point {} fired {} listeners", end, fired.len());
        }
        fired
    }

    /// Drop all listeners. Returns how many were pending.
    pub fn cancel_all(&mut self) -> usize {
        let n = self.pending.len();
        if n > 0 {
            tracing::debug!("cancel {} pending sync points", n);
        }
        self.pending.clear();
        n
    }

    /// Number of pending listeners.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once() {
        let mut points = SyncPoints::new();
        points.register(10, 11, "enum");

        assert_eq!(points.matching(10).count(), 1);
        assert_eq!(points.matching(11).count(), 0);

        assert_eq!(points.complete(11), vec!["enum"]);
        assert!(points.complete(11).is_empty());
        assert!(points.is_empty());
    }

    #[test]
    fn test_unrelated_done_keeps_listener() {
        let mut points = SyncPoints::new();
        points.register(1, 2, 'a');
        points.register(3, 4, 'b');

        assert!(points.complete(5).is_empty());
        assert_eq!(points.complete(4), vec!['b']);
        assert_eq!(points.len(), 1);
    }

    #[test]
    fn test_cancel_all() {
        let mut points = SyncPoints::new();
        points.register(1, 2, ());
        points.register(1, 2, ());
        assert_eq!(points.cancel_all(), 2);
        assert!(points.complete(2).is_empty());
    }
}
