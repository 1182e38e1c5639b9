//! Connection state as the engine sees it.
//!
//! The engine never touches sockets. The network loop pushes raw bytes
//! in through [`Connection::push_input`] and drains [`Connection::take_output`]
//! after each scheduling round; framing beyond line assembly (telnet
//! negotiation, CR/LF policy on the wire) stays on the server side.

use std::collections::VecDeque;

use uuid::Uuid;

use crate::fiber::FiberId;

/// Handle into the engine's connection table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) u32);

/// Input buffered per connection before the bound fiber consumes it.
/// A peer that exceeds this without sending a newline is dropped.
pub const INPUT_LIMIT: usize = 64 * 1024;

#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    /// Peer address label, for logs and inspection.
    pub peer: String,
    input: VecDeque<u8>,
    outbox: Vec<u8>,
    /// Fiber bound to this connection; its `connection` field points back.
    pub fiber: Option<FiberId>,
    pub closing: bool,
}

impl Connection {
    pub fn new(id: Uuid, peer: String) -> Self {
        Self {
            id,
            peer,
            input: VecDeque::new(),
            outbox: Vec::new(),
            fiber: None,
            closing: false,
        }
    }

    /// Append received bytes. `false` means the input limit was blown
    /// and the caller should drop the connection.
    pub fn push_input(&mut self, bytes: &[u8]) -> bool {
        if self.input.len() + bytes.len() > INPUT_LIMIT {
            return false;
        }
        self.input.extend(bytes);
        true
    }

    /// Whether a complete line is buffered.
    pub fn has_line(&self) -> bool {
        self.input.contains(&b'\n')
    }

    /// Take one complete line off the buffer, without its terminator.
    /// A trailing `\r` is stripped; bytes are decoded lossily.
    pub fn read_line(&mut self) -> Option<String> {
        let newline = self.input.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.input.drain(..=newline).collect();
        line.pop(); // the newline itself
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    pub fn write_str(&mut self, s: &str) {
        self.outbox.extend_from_slice(s.as_bytes());
    }

    /// Drain pending output for the network loop.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbox)
    }

    pub fn has_output(&self) -> bool {
        !self.outbox.is_empty()
    }
}

/// Slot arena for connections.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    slots: Vec<Option<Connection>>,
    free: Vec<u32>,
}

impl ConnectionTable {
    pub fn insert(&mut self, connection: Connection) -> ConnId {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(connection);
                ConnId(idx)
            }
            None => {
                self.slots.push(Some(connection));
                ConnId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let connection = self.slots.get_mut(id.0 as usize)?.take();
        if connection.is_some() {
            self.free.push(id.0);
        }
        connection
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &Connection)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|c| (ConnId(i as u32), c)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnId, &mut Connection)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|c| (ConnId(i as u32), c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::new(Uuid::now_v7(), "test".to_string())
    }

    #[test]
    fn line_assembly() {
        let mut c = conn();
        assert!(c.push_input(b"hel"));
        assert!(!c.has_line());
        assert!(c.read_line().is_none());

        assert!(c.push_input(b"lo\r\nworld\n"));
        assert_eq!(c.read_line().as_deref(), Some("hello"));
        assert_eq!(c.read_line().as_deref(), Some("world"));
        assert!(c.read_line().is_none());
    }

    #[test]
    fn empty_line_is_a_line() {
        let mut c = conn();
        c.push_input(b"\n");
        assert_eq!(c.read_line().as_deref(), Some(""));
    }

    #[test]
    fn input_limit_is_enforced() {
        let mut c = conn();
        let chunk = vec![b'x'; INPUT_LIMIT];
        assert!(c.push_input(&chunk));
        assert!(!c.push_input(b"y"));
    }

    #[test]
    fn output_drains_once() {
        let mut c = conn();
        c.write_str("hi ");
        c.write_str("there");
        assert_eq!(c.take_output(), b"hi there".to_vec());
        assert!(c.take_output().is_empty());
    }
}
