//! Per-RS-485-port configuration, statistics and ready queue.
//!
//! These fields back the register windows served by the control processor.

use std::collections::VecDeque;

use crate::message::MessageId;

pub const NUM_PORTS: usize = 9; // 0 = control, 1..=8 = data ports
pub const PORT_DESCRIPTION_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None = 0,
    Odd = 1,
    Even = 2,
}

impl Parity {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Parity::None),
            1 => Some(Parity::Odd),
            2 => Some(Parity::Even),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortParams {
    /// Actual baud rate (the register holds this divided by 100).
    pub baud_rate: u32,
    pub parity: u8,
    pub powered: u8,
    pub request_timeout_ms: u16,
    pub description: [u8; PORT_DESCRIPTION_SIZE],
}

impl PortParams {
    fn default_for(index: u8) -> Self {
        let mut description = [b' '; PORT_DESCRIPTION_SIZE];
        let label = if index == 0 {
            "ctrl".to_string()
        } else {
            format!("port{index}")
        };
        let bytes = label.as_bytes();
        let n = bytes.len().min(PORT_DESCRIPTION_SIZE);
        description[..n].copy_from_slice(&bytes[..n]);

        PortParams {
            baud_rate: 19200,
            parity: Parity::Even as u8,
            powered: 0,
            request_timeout_ms: 5000,
            description,
        }
    }

    pub fn set_description(&mut self, desc: &str) {
        let bytes = desc.as_bytes();
        let n = bytes.len().min(PORT_DESCRIPTION_SIZE);
        self.description[..n].copy_from_slice(&bytes[..n]);
        for b in &mut self.description[n..] {
            *b = b' ';
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PortStats {
    pub current_sense: u16,
    pub broadcasts: u32,
    pub unicasts: u32,
    pub frame_errors: u32,
    pub oversize_errors: u32,
    pub undersize_errors: u32,
    pub crc_errors: u32,
    pub mismatch_errors: u32,
    pub timeouts: u32,
}

impl PortStats {
    pub fn reset(&mut self) {
        let sense = self.current_sense;
        *self = PortStats::default();
        self.current_sense = sense;
    }
}

pub struct Port {
    pub index: u8,
    pub params: PortParams,
    pub stats: PortStats,
    /// Messages received for this port, waiting to be handed to the
    /// scheduler.
    pub ready: VecDeque<MessageId>,
    pub listener_token: Option<mio::Token>,
}

impl Port {
    pub fn new(index: u8) -> Self {
        Port {
            index,
            params: PortParams::default_for(index),
            stats: PortStats::default(),
            ready: VecDeque::new(),
            listener_token: None,
        }
    }

    /// Holding register 1 (`baud_rate / 100`).
    pub fn baud_register(&self) -> u16 {
        (self.params.baud_rate / 100) as u16
    }
}
