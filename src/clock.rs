//! # Summary
//!
//! Lamport logical clock. The clock itself is a plain counter; it is only
//! ever touched through the node's shared state lock, which is what makes
//! it safe to advance from connection handlers and the execution task alike.

/// Logical timestamp.
pub type Timestamp = usize;

/// Largest timestamp accepted off the wire. Anything above it is a
/// malformed message; the local clock stays far below overflow.
pub const LIMIT: Timestamp = Timestamp::MAX / 2;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Clock(Timestamp);

impl Clock {
    pub fn new() -> Self {
        Clock(0)
    }

    /// Current value without advancing.
    pub fn now(&self) -> Timestamp {
        self.0
    }

    /// Local event: advances by exactly one and returns the new value.
    pub fn tick(&mut self) -> Timestamp {
        self.0 = self.0.saturating_add(1);
        self.0
    }

    /// Receive event carrying a remote timestamp.
    pub fn observe(&mut self, remote: Timestamp) -> Timestamp {
        self.0 = std::cmp::max(self.0, remote).saturating_add(1);
        self.0
    }
}
