//! MODBUS-TCP client connections: frame parsing, reply encoding and the
//! receive/busy bookkeeping a client needs so its in-flight messages can be
//! orphaned cleanly on disconnect.

use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use log::debug;
use mio::net::TcpStream;

use crate::message::{MessageArena, MessageId, MODBUS_MAX_DATA_SIZE};
use crate::switch::Switch;
use crate::timer::{TimerId, TimerKind, TimerWheel};

pub const MODBUS_TCP_HEADER_LEN: usize = 6;

#[derive(Debug)]
pub enum FrameError {
    BadProtocolId(u16),
    Undersized(u16),
    Oversized(u16),
}

/// Looks for one complete frame at the start of `buf`. Returns the byte
/// count to consume, the transaction ID and the PDU slice (unit address,
/// function code and data, `L` bytes per the MODBUS-TCP length field), or
/// `None` if more bytes are needed.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(usize, u16, &[u8])>, FrameError> {
    if buf.len() < MODBUS_TCP_HEADER_LEN {
        return Ok(None);
    }
    let protocol_id = u16::from_be_bytes([buf[2], buf[3]]);
    if protocol_id != 0 {
        return Err(FrameError::BadProtocolId(protocol_id));
    }
    let len = u16::from_be_bytes([buf[4], buf[5]]);
    if len < 2 {
        return Err(FrameError::Undersized(len));
    }
    if len as usize > 2 + MODBUS_MAX_DATA_SIZE {
        return Err(FrameError::Oversized(len));
    }
    let total = MODBUS_TCP_HEADER_LEN + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let transaction_id = u16::from_be_bytes([buf[0], buf[1]]);
    let pdu = &buf[MODBUS_TCP_HEADER_LEN..total];
    Ok(Some((total, transaction_id, pdu)))
}

/// Prepends a MODBUS-TCP header to a reply PDU.
pub fn encode_reply(transaction_id: u16, reply: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MODBUS_TCP_HEADER_LEN + reply.len());
    out.extend_from_slice(&transaction_id.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&(reply.len() as u16).to_be_bytes());
    out.extend_from_slice(reply);
    out
}

pub struct Client {
    pub id: u64,
    pub switch: usize,
    pub port: u8,
    pub stream: TcpStream,
    pub token: mio::Token,
    pub peer: String,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,
    /// Received, not yet handed to the scheduler.
    pub rx: Vec<MessageId>,
    /// Submitted to the scheduler or control processor, awaiting a reply.
    pub busy: Vec<MessageId>,
    pub idle_timer: Option<TimerId>,
}

impl Client {
    pub fn new(id: u64, switch: usize, port: u8, stream: TcpStream, token: mio::Token, peer: String) -> Self {
        Client {
            id,
            switch,
            port,
            stream,
            token,
            peer,
            read_buf: Vec::with_capacity(MODBUS_TCP_HEADER_LEN + MODBUS_MAX_DATA_SIZE),
            write_buf: Vec::new(),
            write_pos: 0,
            rx: Vec::new(),
            busy: Vec::new(),
            idle_timer: None,
        }
    }

    /// Re-arms the idle timeout after activity.
    pub fn touch_idle(&mut self, wheel: &mut TimerWheel, timeout: Duration) {
        if let Some(id) = self.idle_timer.take() {
            wheel.cancel(id);
        }
        self.idle_timer = Some(wheel.add(timeout, TimerKind::ClientIdle { client: self.id }));
    }

    /// Reads whatever is available and extracts complete frames, allocating
    /// one [`crate::message::Message`] per frame and handing its ID back to
    /// the caller for queueing onto the owning port's ready list.
    ///
    /// Returns `Err` (caller must disconnect the client) on a protocol
    /// violation or a genuine I/O error; `Ok(false)` signals a clean EOF.
    pub fn on_readable(&mut self, arena: &mut MessageArena) -> io::Result<(Vec<MessageId>, bool)> {
        let mut tmp = [0u8; 4096];
        let mut new_ids = Vec::new();
        loop {
            match self.stream.read(&mut tmp) {
                Ok(0) => return Ok((new_ids, false)),
                Ok(n) => self.read_buf.extend_from_slice(&tmp[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut consumed_total = 0;
        loop {
            match parse_frame(&self.read_buf[consumed_total..]) {
                Ok(Some((consumed, transaction_id, pdu))) => {
                    let id = arena.alloc(self.switch, self.id, self.port);
                    let msg = arena.get_mut(id);
                    msg.client_transaction_id = transaction_id;
                    msg.request_len = pdu.len();
                    msg.request[..pdu.len()].copy_from_slice(pdu);
                    debug!(
                        "client {}: frame #{:04x} of {} bytes for port {}",
                        self.id, transaction_id, pdu.len(), self.port
                    );
                    self.rx.push(id);
                    new_ids.push(id);
                    consumed_total += consumed;
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("client {}: {e:?}", self.id);
                    return Err(io::Error::new(ErrorKind::InvalidData, format!("{e:?}")));
                }
            }
        }
        self.read_buf.drain(..consumed_total);
        Ok((new_ids, true))
    }

    /// Queues a reply frame for writing. Call [`Self::flush_writes`]
    /// afterwards (the reactor does this on every tick a client has pending
    /// output).
    pub fn queue_reply(&mut self, transaction_id: u16, reply: &[u8]) {
        self.write_buf.extend_from_slice(&encode_reply(transaction_id, reply));
    }

    pub fn has_pending_writes(&self) -> bool {
        self.write_pos < self.write_buf.len()
    }

    /// Drains as much of the pending output as the socket accepts right
    /// now. Returns `Err` on a genuine write error.
    pub fn flush_writes(&mut self) -> io::Result<()> {
        while self.write_pos < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => break,
                Ok(n) => self.write_pos += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.write_pos == self.write_buf.len() {
            self.write_buf.clear();
            self.write_pos = 0;
        }
        Ok(())
    }
}

/// Tears down a disconnected client: unprocessed messages are freed
/// outright, in-flight messages are orphaned in place (their `client`
/// field is cleared but they stay on whatever busy/control list already
/// holds them).
pub fn disconnect(client: &mut Client, switch: &mut Switch, arena: &mut MessageArena) {
    for id in client.rx.drain(..) {
        let port = arena.get(id).port;
        if let Some(pos) = switch.ports[port as usize].ready.iter().position(|&x| x == id) {
            switch.ports[port as usize].ready.remove(pos);
        }
        arena.free(id);
    }
    for id in client.busy.drain(..) {
        arena.get_mut(id).client = None;
        switch.orphaned.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_frame() {
        let mut buf = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x03, 0x06];
        let (consumed, tid, pdu) = parse_frame(&buf).unwrap().unwrap();
        assert_eq!(consumed, 8);
        assert_eq!(tid, 1);
        assert_eq!(pdu, &[0x03, 0x06]);
        buf.clear();
    }

    #[test]
    fn rejects_nonzero_protocol_id() {
        let buf = [0x00, 0x01, 0x00, 0x01, 0x00, 0x02, 0x03, 0x06];
        assert!(matches!(parse_frame(&buf), Err(FrameError::BadProtocolId(1))));
    }

    #[test]
    fn rejects_undersized_length() {
        let buf = [0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x03];
        assert!(matches!(parse_frame(&buf), Err(FrameError::Undersized(1))));
    }

    #[test]
    fn waits_for_more_bytes() {
        let buf = [0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x03, 0x06];
        assert!(parse_frame(&buf).unwrap().is_none());
    }

    #[test]
    fn reply_encoding_round_trips_header() {
        let encoded = encode_reply(0x55aa, &[1, 2, 3]);
        assert_eq!(&encoded[0..2], &[0x55, 0xaa]);
        assert_eq!(&encoded[2..4], &[0, 0]);
        assert_eq!(&encoded[4..6], &[0, 3]);
        assert_eq!(&encoded[6..], &[1, 2, 3]);
    }
}
