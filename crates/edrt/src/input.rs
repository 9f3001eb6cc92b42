//! Boundary to the terminal input decoder
//!
//! The runtime does not know any escape-sequence table. The editor supplies
//! a stateless [`KeyDecoder`] that turns one raw chunk from the terminal
//! reader into a key code and a shift flag.

/// A decoded key press
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub code: u32,
    pub shift: bool,
}

impl Key {
    pub const fn new(code: u32, shift: bool) -> Self {
        Self { code, shift }
    }
}

/// Stateless raw-bytes to key decoder
///
/// Runs on the terminal reader thread, so it must not touch editor state.
/// `None` means the chunk held no key (an incomplete or ignored sequence).
pub trait KeyDecoder: Send + 'static {
    fn decode(&self, bytes: &[u8]) -> Option<Key>;
}

impl<F> KeyDecoder for F
where
    F: Fn(&[u8]) -> Option<Key> + Send + 'static,
{
    fn decode(&self, bytes: &[u8]) -> Option<Key> {
        self(bytes)
    }
}
