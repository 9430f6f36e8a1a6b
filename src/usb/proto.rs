//! Wire formats for the vendor control requests and bulk messages exchanged
//! with the switch's firmware.

pub const USB_VENDOR: u16 = 0x4242;
pub const USB_PRODUCT: u16 = 0x000b;

pub const EP_BULK_OUT: u8 = 0x01;
pub const EP_BULK_IN: u8 = 0x82;

pub const BULK_HEADER_LEN: usize = 4; // port, frame_size, message_id (2 bytes LE)
pub const BULK_MAX_FRAME: usize = 254;
pub const WINDOW_OPEN_PORT: u8 = 0xff;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    GetConfig = 0,
    SetPortParams = 1,
    GetPortStatus = 2,
    GetPowerStatus = 3,
}

/// `urs485_config`: `{ max_in_flight: u16 }`.
pub fn parse_config(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

/// `urs485_port_params`: `{ baud_rate: u32; parity: u8; powered: u8; request_timeout: u16 }`.
pub fn encode_port_params(baud_rate: u32, parity: u8, powered: u8, request_timeout: u16) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&baud_rate.to_le_bytes());
    buf[4] = parity;
    buf[5] = powered;
    buf[6..8].copy_from_slice(&request_timeout.to_le_bytes());
    buf
}

/// `urs485_port_status`: current sense plus the eight 32-bit counters, in
/// the order the port statistics are defined in.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortStatusWire {
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

pub const PORT_STATUS_WIRE_LEN: usize = 2 + 2 /* rfu */ + 4 * 8;

impl PortStatusWire {
    pub fn decode(buf: &[u8]) -> Self {
        let u32_at = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        PortStatusWire {
            current_sense: u16::from_le_bytes([buf[0], buf[1]]),
            broadcasts: u32_at(4),
            unicasts: u32_at(8),
            frame_errors: u32_at(12),
            oversize_errors: u32_at(16),
            undersize_errors: u32_at(20),
            crc_errors: u32_at(24),
            mismatch_errors: u32_at(28),
            timeouts: u32_at(32),
        }
    }
}

/// Encodes one outgoing bulk MODBUS message: header + frame.
pub fn encode_bulk_message(port: u8, message_id: u16, frame: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(BULK_HEADER_LEN + frame.len());
    buf.push(port);
    buf.push(frame.len() as u8);
    buf.extend_from_slice(&message_id.to_le_bytes());
    buf.extend_from_slice(frame);
    buf
}

/// Decodes one incoming bulk MODBUS message.
pub struct BulkMessage<'a> {
    pub port: u8,
    pub message_id: u16,
    pub frame: &'a [u8],
}

pub fn decode_bulk_message(buf: &[u8]) -> Option<BulkMessage<'_>> {
    if buf.len() < BULK_HEADER_LEN {
        return None;
    }
    let port = buf[0];
    let frame_size = buf[1] as usize;
    let message_id = u16::from_le_bytes([buf[2], buf[3]]);
    let frame = buf.get(BULK_HEADER_LEN..BULK_HEADER_LEN + frame_size)?;
    Some(BulkMessage { port, message_id, frame })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_message_round_trips() {
        let frame = [1u8, 6, 0, 1, 0, 0x2a];
        let encoded = encode_bulk_message(2, 0x1234, &frame);
        let decoded = decode_bulk_message(&encoded).unwrap();
        assert_eq!(decoded.port, 2);
        assert_eq!(decoded.message_id, 0x1234);
        assert_eq!(decoded.frame, &frame);
    }

    #[test]
    fn window_open_token_has_no_meaningful_payload() {
        let encoded = encode_bulk_message(WINDOW_OPEN_PORT, 0, &[]);
        let decoded = decode_bulk_message(&encoded).unwrap();
        assert_eq!(decoded.port, WINDOW_OPEN_PORT);
        assert!(decoded.frame.is_empty());
    }

    #[test]
    fn port_status_decodes_counters_in_defined_order() {
        let mut buf = vec![0u8; PORT_STATUS_WIRE_LEN];
        buf[0..2].copy_from_slice(&7u16.to_le_bytes());
        buf[4..8].copy_from_slice(&1u32.to_le_bytes());
        buf[8..12].copy_from_slice(&2u32.to_le_bytes());
        let s = PortStatusWire::decode(&buf);
        assert_eq!(s.current_sense, 7);
        assert_eq!(s.broadcasts, 1);
        assert_eq!(s.unicasts, 2);
    }
}
