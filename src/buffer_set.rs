//! Buffers shared between a driver and its state machines.

/// Buffers a driver lends to a state machine on each `step`.
///
/// The driver fills `read_buffer` and `type_byte` with the payload and tag of
/// the last message read (or the single SSL answer byte), and writes out
/// `write_buffer` when the action asks for it.
#[derive(Debug)]
pub struct BufferSet {
    /// Payload of the last message read
    pub read_buffer: Vec<u8>,
    /// Outgoing messages
    pub write_buffer: Vec<u8>,
    /// RowDescription payload of the result in progress, re-parsed per row
    pub column_buffer: Vec<u8>,
    /// Type byte of the last message read
    pub type_byte: u8,
}

impl BufferSet {
    /// Create a new buffer set.
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::with_capacity(8192),
            write_buffer: Vec::with_capacity(8192),
            column_buffer: Vec::with_capacity(512),
            type_byte: 0,
        }
    }

    /// Forget everything from a previous session.
    pub fn clear(&mut self) {
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.column_buffer.clear();
        self.type_byte = 0;
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}
