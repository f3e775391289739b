//! HTTP/2 flow control
//!
//! This module implements flow control as defined in RFC 7540 Section 5.2.
//!
//! Every stream and the connection as a whole carry one window per
//! direction. The send window limits the DATA this endpoint may send; the
//! receive window tracks what the peer may still send before it needs a
//! WINDOW_UPDATE from us.

use super::error::{Error, Result};
use super::{DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE};

/// Flow control window
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial_size: u32,
    /// Current window size; negative after a SETTINGS reduction of the initial size
    current_size: i64,
}

impl FlowControlWindow {
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    pub fn size(&self) -> i64 {
        self.current_size
    }

    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Bytes that may be sent now
    pub fn available(&self) -> usize {
        self.current_size.max(0) as usize
    }

    /// Take `amount` bytes of sent DATA off the window
    ///
    /// Callers size their frames with [`available`](Self::available), so the
    /// window never goes below zero through this call.
    pub fn consume(&mut self, amount: usize) -> Result<()> {
        if amount as i64 > self.current_size {
            return Err(Error::FlowControl(format!(
                "{} bytes exceed the window of {}",
                amount, self.current_size
            )));
        }
        self.current_size -= amount as i64;
        Ok(())
    }

    /// Increase window size by exactly `increment` (WINDOW_UPDATE)
    ///
    /// Growing the window past 2^31-1 is a flow control error
    /// (RFC 7540 Section 6.9.1).
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        let new_size = self.current_size + increment as i64;
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }
        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Apply a new initial window size from SETTINGS
    ///
    /// The difference to the old initial size is added to the current size,
    /// which may leave the window negative (RFC 7540 Section 6.9.2).
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + diff;
        if new_current > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "New window size {} exceeds maximum (2^31-1)",
                new_current
            )));
        }
        self.initial_size = new_initial_size;
        self.current_size = new_current;
        Ok(())
    }

    /// Increment that brings the window back to its initial size once it
    /// dropped below half of it
    pub fn replenish_threshold(&self) -> Option<u32> {
        let initial = self.initial_size as i64;
        if self.current_size < initial / 2 {
            Some((initial - self.current_size) as u32)
        } else {
            None
        }
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Send and receive windows of one stream or of the connection
#[derive(Debug, Clone)]
pub struct FlowControl {
    send_window: FlowControlWindow,
    recv_window: FlowControlWindow,
}

impl FlowControl {
    pub fn new(send_size: u32, recv_size: u32) -> Self {
        FlowControl {
            send_window: FlowControlWindow::with_initial_size(send_size),
            recv_window: FlowControlWindow::with_initial_size(recv_size),
        }
    }

    pub fn send_window(&self) -> &FlowControlWindow {
        &self.send_window
    }

    pub fn send_window_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.send_window
    }

    pub fn recv_window(&self) -> &FlowControlWindow {
        &self.recv_window
    }

    pub fn recv_window_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.recv_window
    }

    /// Bytes of DATA that may be sent now
    pub fn send_capacity(&self) -> usize {
        self.send_window.available()
    }

    /// Charge sent DATA against the send window
    pub fn consume_send_window(&mut self, amount: usize) -> Result<()> {
        self.send_window.consume(amount)
    }

    /// WINDOW_UPDATE received from the peer
    pub fn increase_send_window(&mut self, increment: u32) -> Result<i64> {
        self.send_window.increase(increment)
    }

    /// Charge received DATA against the receive window
    ///
    /// A peer sending more than the window allows commits a flow control error.
    pub fn consume_recv_window(&mut self, amount: usize) -> Result<()> {
        if amount as i64 > self.recv_window.size() {
            return Err(Error::FlowControl(format!(
                "peer sent {} bytes into a window of {}",
                amount,
                self.recv_window.size()
            )));
        }
        self.recv_window.current_size -= amount as i64;
        Ok(())
    }

    /// Increment to announce once the receive window fell below half its size
    pub fn should_send_window_update(&self) -> Option<u32> {
        self.recv_window.replenish_threshold()
    }

    /// WINDOW_UPDATE sent to the peer
    pub fn send_window_update(&mut self, increment: u32) -> Result<i64> {
        self.recv_window.increase(increment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_control_window_basic() {
        let window = FlowControlWindow::new();
        assert_eq!(window.size(), DEFAULT_INITIAL_WINDOW_SIZE as i64);
        assert_eq!(window.available(), 65535);
    }

    #[test]
    fn test_consume_never_exceeds_window() {
        let mut window = FlowControlWindow::with_initial_size(100);
        window.consume(60).unwrap();
        assert_eq!(window.available(), 40);
        assert!(window.consume(41).is_err());
        assert_eq!(window.size(), 40);
        window.consume(40).unwrap();
        assert_eq!(window.available(), 0);
    }

    #[test]
    fn test_window_update_adds_exactly_increment() {
        let mut window = FlowControlWindow::with_initial_size(100);
        window.consume(50).unwrap();
        for increment in [1u32, 7, 1000] {
            let before = window.size();
            assert_eq!(window.increase(increment).unwrap(), before + increment as i64);
        }
        assert_eq!(window.size(), 1058);
    }

    #[test]
    fn test_flow_control_window_overflow() {
        let mut window = FlowControlWindow::with_initial_size(MAX_WINDOW_SIZE);
        assert!(matches!(window.increase(1), Err(Error::FlowControl(_))));
        assert_eq!(window.size(), MAX_WINDOW_SIZE as i64);
    }

    #[test]
    fn test_update_initial_size_may_go_negative() {
        let mut window = FlowControlWindow::with_initial_size(100);
        window.consume(80).unwrap();

        window.update_initial_size(200).unwrap();
        assert_eq!(window.size(), 120);

        window.update_initial_size(50).unwrap();
        assert_eq!(window.size(), -30);
        assert_eq!(window.available(), 0);

        window.increase(40).unwrap();
        assert_eq!(window.available(), 10);
    }

    #[test]
    fn test_receive_window() {
        let mut flow = FlowControl::new(65535, 100);
        assert_eq!(flow.should_send_window_update(), None);
        flow.consume_recv_window(60).unwrap();
        assert_eq!(flow.should_send_window_update(), Some(60));
        assert!(flow.consume_recv_window(41).is_err());

        flow.send_window_update(60).unwrap();
        assert_eq!(flow.recv_window().size(), 100);
        assert_eq!(flow.should_send_window_update(), None);
    }

    #[test]
    fn test_send_capacity() {
        let mut flow = FlowControl::new(10, 65535);
        assert_eq!(flow.send_capacity(), 10);
        flow.consume_send_window(10).unwrap();
        assert_eq!(flow.send_capacity(), 0);
        flow.increase_send_window(5).unwrap();
        assert_eq!(flow.send_capacity(), 5);
        assert_eq!(flow.send_window().initial_size(), 10);
    }
}
