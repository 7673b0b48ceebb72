//! The realtime notification channel of an exported node.
//!
//! The driver writes a token on `read` whenever the node has to run a cycle;
//! the node writes a token on `write` when it produced something. The channel
//! is owned by the data loop. An error or hangup tears it down for good: both
//! descriptors are closed and it is never polled again.

use super::eventfd::EventFd;
use crate::error::{Error, Result};
use rustix::event::{PollFd, PollFlags};
use rustix::fd::OwnedFd;

/// What the data loop has to do after a condition on the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    /// Run one processing cycle.
    Process,
    /// The channel was torn down by this event.
    Lost,
    /// Nothing to do.
    Ignored,
}

/// Pair of eventfds between driver and node.
#[derive(Debug)]
pub struct TransportChannel {
    node_id: u32,
    read: Option<EventFd>,
    write: Option<EventFd>,
    interest: PollFlags,
    teardowns: u32,
}

impl TransportChannel {
    /// Channel for `node_id` from the descriptors of a `Transport` message.
    ///
    /// Only errors are watched until processing is enabled.
    pub fn new(node_id: u32, read: OwnedFd, write: OwnedFd) -> Self {
        tracing::debug!("create transport for node {}", node_id);
        Self {
            node_id,
            read: Some(EventFd::from_fd(read)),
            write: Some(EventFd::from_fd(write)),
            interest: PollFlags::ERR | PollFlags::HUP,
            teardowns: 0,
        }
    }

    /// Id the driver gave the node.
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// True until the channel is torn down.
    pub fn is_open(&self) -> bool {
        self.read.is_some()
    }

    /// Number of times the channel was torn down (0 or 1).
    pub fn teardown_count(&self) -> u32 {
        self.teardowns
    }

    /// Events the data loop polls for.
    pub fn interest(&self) -> PollFlags {
        self.interest
    }

    /// Start or stop reacting to wake-ups. Errors are always watched.
    pub fn set_process_enabled(&mut self, enabled: bool) {
        self.interest = if enabled {
            PollFlags::IN | PollFlags::ERR | PollFlags::HUP
        } else {
            PollFlags::ERR | PollFlags::HUP
        };
        tracing::trace!("node {}: transport interest {:?}", self.node_id, self.interest);
    }

    /// Poll entry for the read side, `None` once torn down.
    pub fn poll_fd(&self) -> Option<PollFd<'_>> {
        self.read.as_ref().map(|fd| PollFd::new(fd, self.interest))
    }

    /// React to `mask` reported for the read side.
    pub fn handle_condition(&mut self, mask: PollFlags) -> Condition {
        if !self.is_open() {
            return Condition::Ignored;
        }

        if mask.intersects(PollFlags::ERR | PollFlags::HUP | PollFlags::NVAL) {
            tracing::warn!("node {}: transport error {:?}", self.node_id, mask);
            self.teardown();
            return Condition::Lost;
        }

        if mask.contains(PollFlags::IN) {
            if let Some(read) = &self.read {
                match read.read_token() {
                    Ok(Some(1)) => {}
                    Ok(token) => {
                        tracing::warn!("node {}: unexpected wake token {:?}", self.node_id, token)
                    }
                    Err(e) => tracing::warn!("node {}: read failed: {}", self.node_id, e),
                }
            }
            return Condition::Process;
        }

        Condition::Ignored
    }

    /// Wake the driver.
    pub fn signal(&self) -> Result<()> {
        tracing::trace!("node {}: send process", self.node_id);
        self.write.as_ref().ok_or(Error::TransportClosed)?.notify()
    }

    /// Close both descriptors. Returns false if already torn down.
    pub fn teardown(&mut self) -> bool {
        if self.read.take().is_none() {
            return false;
        }
        self.write = None;
        self.teardowns += 1;
        tracing::debug!("node {}: transport removed", self.node_id);
        true
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (TransportChannel, EventFd, EventFd) {
        let to_node = EventFd::new().unwrap();
        let from_node = EventFd::new().unwrap();
        let channel = TransportChannel::new(
            7,
            to_node.try_clone_fd().unwrap(),
            from_node.try_clone_fd().unwrap(),
        );
        (channel, to_node, from_node)
    }

    #[test]
    fn test_interest_follows_process_enable() {
        let (mut channel, _, _) = channel();
        assert!(!channel.interest().contains(PollFlags::IN));
        channel.set_process_enabled(true);
        assert!(channel.interest().contains(PollFlags::IN | PollFlags::ERR | PollFlags::HUP));
        channel.set_process_enabled(false);
        assert_eq!(channel.interest(), PollFlags::ERR | PollFlags::HUP);
    }

    #[test]
    fn test_in_drains_token() {
        let (mut channel, to_node, _) = channel();
        to_node.notify().unwrap();
        assert_eq!(channel.handle_condition(PollFlags::IN), Condition::Process);
        // Token consumed through the shared counter
        assert!(!to_node.try_wait().unwrap());
    }

    #[test]
    fn test_signal_wakes_driver() {
        let (channel, _, from_node) = channel();
        channel.signal().unwrap();
        assert_eq!(from_node.read_token().unwrap(), Some(1));
    }

    #[test]
    fn test_hangup_tears_down_once() {
        let (mut channel, _, _) = channel();
        assert_eq!(channel.handle_condition(PollFlags::HUP), Condition::Lost);
        assert_eq!(channel.handle_condition(PollFlags::ERR), Condition::Ignored);
        assert_eq!(channel.handle_condition(PollFlags::IN), Condition::Ignored);
        assert_eq!(channel.teardown_count(), 1);
        assert!(!channel.is_open());
        assert!(channel.poll_fd().is_none());
        assert!(matches!(channel.signal(), Err(Error::TransportClosed)));
    }

    #[test]
    fn test_error_wins_over_in() {
        let (mut channel, _, _) = channel();
        assert_eq!(
            channel.handle_condition(PollFlags::IN | PollFlags::ERR),
            Condition::Lost
        );
        assert!(!channel.teardown());
        assert_eq!(channel.teardown_count(), 1);
    }
}
