//! Session state flags
//!
//! The boolean block tracked per connection. A session may not send
//! `Request` until `am_interested` is set and `peer_choking` has been
//! cleared by an Unchoke.

/// Protocol state for one peer connection.
#[derive(Debug, Clone, Copy)]
pub struct SessionState {
    /// Our handshake went out
    pub handshake_sent: bool,
    /// The peer's handshake was received and validated
    pub handshake_recv: bool,
    /// The peer sent an actual Bitfield frame (it is optional)
    pub bitfield_recv: bool,
    /// We have sent Interested
    pub am_interested: bool,
    /// The peer is choking us (initial state per the protocol)
    pub peer_choking: bool,
    /// The peer's handshake advertised BEP-10 support
    pub peer_supports_ext: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            handshake_sent: false,
            handshake_recv: false,
            bitfield_recv: false,
            am_interested: false,
            peer_choking: true,
            peer_supports_ext: false,
        }
    }
}

impl SessionState {
    /// Whether Request frames are currently allowed.
    pub fn can_request(&self) -> bool {
        self.handshake_recv && self.am_interested && !self.peer_choking
    }
}
