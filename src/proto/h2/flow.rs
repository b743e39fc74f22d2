//! Flow-control windows.

use super::frame::MAX_WINDOW_SIZE;
use crate::error::{Error, Result};

/// A send or receive window. Windows may go negative when the peer shrinks
/// `INITIAL_WINDOW_SIZE` while data is in flight.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlowControl {
    window: i64,
}

impl FlowControl {
    pub(crate) fn new(initial: u32) -> Self {
        Self {
            window: initial as i64,
        }
    }

    /// Bytes that may be sent right now.
    pub(crate) fn available(&self) -> usize {
        self.window.max(0) as usize
    }

    pub(crate) fn consume(&mut self, amount: usize) {
        self.window -= amount as i64;
    }

    /// Apply a WINDOW_UPDATE. Fails when the window would exceed the
    /// protocol maximum.
    pub(crate) fn expand(&mut self, amount: u32) -> Result<()> {
        let next = self.window + amount as i64;
        if next > MAX_WINDOW_SIZE as i64 {
            return Err(Error::new_http().with_message("flow-control window overflow"));
        }
        self.window = next;
        Ok(())
    }

    /// Apply a delta caused by a changed `INITIAL_WINDOW_SIZE`.
    pub(crate) fn adjust(&mut self, delta: i64) {
        self.window += delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_and_expand() {
        let mut flow = FlowControl::new(10);
        flow.consume(4);
        assert_eq!(flow.available(), 6);
        flow.expand(10).unwrap();
        assert_eq!(flow.available(), 16);
    }

    #[test]
    fn negative_window_after_adjust() {
        let mut flow = FlowControl::new(10);
        flow.consume(8);
        flow.adjust(-10);
        assert_eq!(flow.available(), 0);
        flow.expand(9).unwrap();
        assert_eq!(flow.available(), 1);
    }

    #[test]
    fn overflow_rejected() {
        let mut flow = FlowControl::new(MAX_WINDOW_SIZE);
        assert!(flow.expand(1).is_err());
    }
}
