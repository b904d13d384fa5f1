use crate::codec::MAX_SEQUENCE;

/// Sequence reserved for the login exchange
pub const HANDSHAKE_SEQUENCE: u32 = 0;

/// Outbound sequence numbers for one authenticated session.
///
/// Hands out 1, 2, 3, ... and never the same value twice. Once the 24-bit
/// space is used up it stays exhausted; the session has to log in again and
/// start a fresh counter under fresh keys.
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    next: u32,
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self {
            next: HANDSHAKE_SEQUENCE + 1,
        }
    }

    /// Counter whose next value is `next`
    pub fn starting_at(next: u32) -> Self {
        Self { next }
    }

    /// Take the next sequence number, or `None` once exhausted
    pub fn next(&mut self) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        let sequence = self.next;
        self.next += 1;
        Some(sequence)
    }

    /// Last value handed out
    pub fn last(&self) -> Option<u32> {
        (self.next > HANDSHAKE_SEQUENCE + 1).then(|| self.next - 1)
    }

    pub fn is_exhausted(&self) -> bool {
        self.next > MAX_SEQUENCE
    }
}
