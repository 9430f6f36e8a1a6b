//! The control processor: MODBUS function codes 3/4/6/16/43 against the
//! switch's input and holding registers, including the description and
//! statistics-reset registers.

use crate::error::ModbusException;
use crate::message::{ControlCtx, ControlState, REQUEST_CAP};
use crate::port::{Parity, Port, PortStats};
use crate::usb::proto::PortStatusWire;
use crate::usb::{UsbContext, UsbEngine};

const MODBUS_FUNC_READ_HOLDING_REGISTERS: u8 = 3;
const MODBUS_FUNC_READ_INPUT_REGISTERS: u8 = 4;
const MODBUS_FUNC_WRITE_SINGLE_REGISTER: u8 = 6;
const MODBUS_FUNC_WRITE_MULTIPLE_REGISTERS: u8 = 16;
const MODBUS_FUNC_ENCAPSULATED_INTERFACE_TRANSPORT: u8 = 43;
const MODBUS_EIT_READ_DEVICE_IDENT: u8 = 14;

const IREG_MAX: u32 = 18; // one past URS485_IREG_CNT_TIMEOUTS_HI (17)
const HREG_CONFIG_MAX: u32 = 9; // one past URS485_HREG_DESCRIPTION_4 (8)
const HREG_RESET_STATS: u32 = 0x1000;
const HREG_RESET_MAGIC: u32 = 0xdead;

/// Outcome of one call into [`process_message`], adapted to `UsbEngine`'s
/// synchronous control transfers: a `NeedUsb*` outcome here has already
/// been resolved by the
/// time it's returned, so callers simply inspect `ctx.state` to see whether
/// a follow-up call is required (it never is, currently, but the shape is
/// kept so a future asynchronous USB backend slots in without reshaping the
/// call sites).
pub struct ControlStep {
    pub reply_len: usize,
    /// A holding register actually changed; the caller should debounce a
    /// persistence write for this switch.
    pub persist: bool,
}

struct Cursor<'a> {
    request: &'a [u8],
    rpos: usize,
    rend: usize,
    reply: &'a mut [u8; REQUEST_CAP],
    wpos: usize,
    wend: usize,
}

impl<'a> Cursor<'a> {
    fn read_remains(&self) -> usize {
        self.rend - self.rpos
    }
    fn read_byte(&mut self) -> u8 {
        let v = self.request[self.rpos];
        self.rpos += 1;
        v
    }
    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }
    fn write_remains(&self) -> usize {
        self.wend - self.wpos
    }
    fn write_byte(&mut self, v: u8) {
        self.reply[self.wpos] = v;
        self.wpos += 1;
    }
    fn write_u16(&mut self, v: u16) {
        let [hi, lo] = v.to_be_bytes();
        self.write_byte(hi);
        self.write_byte(lo);
    }

    /// `report_error`: discards the partially written body and rewrites the
    /// exception reply in place.
    fn report_error(&mut self, ctx: &mut ControlCtx, err: ModbusException) {
        self.reply[1] |= 0x80;
        self.reply[2] = err.code();
        self.wpos = 3;
        ctx.state = ControlState::Done;
    }
}

fn check_input_register_addr(addr: u32, need_status: &mut bool) -> bool {
    if (1..IREG_MAX).contains(&addr) {
        *need_status = true;
        true
    } else {
        false
    }
}

fn u32_part(addr: u32, val: u32) -> u16 {
    if addr & 1 == 1 {
        (val >> 16) as u16
    } else {
        (val & 0xffff) as u16
    }
}

fn get_input_register(stats: &PortStats, addr: u32) -> u16 {
    match addr {
        1 => stats.current_sense,
        2 | 3 => u32_part(addr, stats.broadcasts),
        4 | 5 => u32_part(addr, stats.unicasts),
        6 | 7 => u32_part(addr, stats.frame_errors),
        8 | 9 => u32_part(addr, stats.oversize_errors),
        10 | 11 => u32_part(addr, stats.undersize_errors),
        12 | 13 => u32_part(addr, stats.crc_errors),
        14 | 15 => u32_part(addr, stats.mismatch_errors),
        16 | 17 => u32_part(addr, stats.timeouts),
        _ => unreachable!("address validated by check_input_register_addr"),
    }
}

/// `true` for the four wire-configured registers, `false` (but still a
/// valid address) for the description words, which only affect persisted
/// state.
fn check_holding_register_addr(addr: u32) -> bool {
    (1..HREG_CONFIG_MAX).contains(&addr)
}

fn get_holding_register(port: &Port, addr: u32) -> u16 {
    match addr {
        1 => port.baud_register(),
        2 => port.params.parity as u16,
        3 => port.params.powered as u16,
        4 => port.params.request_timeout_ms,
        5..=8 => {
            let base = (addr as usize - 5) * 2;
            u16::from_be_bytes([port.params.description[base], port.params.description[base + 1]])
        }
        _ => unreachable!("address validated by check_holding_register_addr"),
    }
}

fn check_holding_register_write(addr: u32, val: u32) -> bool {
    match addr {
        1 => (12..=1152).contains(&val),
        2 => val <= 2,
        3 => val <= 1,
        4 => (1..=65535).contains(&val),
        5..=8 => val <= 0xffff,
        HREG_RESET_STATS => val == HREG_RESET_MAGIC,
        _ => false,
    }
}

/// `true` if the write should be pushed to the firmware via
/// `SET_PORT_PARAMS`; the description registers and statistics reset never
/// touch the wire.
fn set_holding_register(port: &mut Port, addr: u32, val: u32) -> bool {
    match addr {
        1 => {
            port.params.baud_rate = val * 100;
            true
        }
        2 => {
            port.params.parity = Parity::from_u16(val as u16).expect("validated above") as u8;
            true
        }
        3 => {
            port.params.powered = val as u8;
            true
        }
        4 => {
            port.params.request_timeout_ms = val as u16;
            true
        }
        5..=8 => {
            let base = (addr as usize - 5) * 2;
            let [hi, lo] = (val as u16).to_be_bytes();
            port.params.description[base] = hi;
            port.params.description[base + 1] = lo;
            false
        }
        HREG_RESET_STATS => {
            port.stats.reset();
            false
        }
        _ => unreachable!("address validated by check_holding_register_write"),
    }
}

fn func_read_registers(
    cur: &mut Cursor,
    ctx: &mut ControlCtx,
    port: &mut Port,
    usb: Option<(&UsbEngine, &mut UsbContext)>,
    holding: bool,
) {
    if cur.read_remains() < 4 {
        return cur.report_error(ctx, ModbusException::IllegalDataValue);
    }
    let start = cur.read_u16() as u32;
    let count = cur.read_u16() as u32;
    let bytes = 2 * count as usize;
    if bytes + 1 > cur.write_remains() {
        return cur.report_error(ctx, ModbusException::IllegalDataValue);
    }

    if ctx.state == ControlState::Init {
        for i in 0..count {
            let ok = if holding {
                check_holding_register_addr(start + i)
            } else {
                check_input_register_addr(start + i, &mut ctx.need_get_port_status)
            };
            if !ok {
                return cur.report_error(ctx, ModbusException::IllegalDataAddress);
            }
        }

        if ctx.need_get_port_status {
            match usb {
                Some((engine, usb_ctx)) => match engine.submit_get_port_status(usb_ctx, ctx.for_port) {
                    Some(status) => apply_port_status(port, &status),
                    None => return cur.report_error(ctx, ModbusException::SlaveDeviceFailure),
                },
                None => return cur.report_error(ctx, ModbusException::SlaveDeviceFailure),
            }
            ctx.state = ControlState::UsbRead;
        }
    }

    cur.write_byte(bytes as u8);
    for i in 0..count {
        let v = if holding { get_holding_register(port, start + i) } else { get_input_register(&port.stats, start + i) };
        cur.write_u16(v);
    }
    ctx.state = ControlState::Done;
}

fn apply_port_status(port: &mut Port, status: &PortStatusWire) {
    port.stats.current_sense = status.current_sense;
    port.stats.broadcasts = status.broadcasts;
    port.stats.unicasts = status.unicasts;
    port.stats.frame_errors = status.frame_errors;
    port.stats.oversize_errors = status.oversize_errors;
    port.stats.undersize_errors = status.undersize_errors;
    port.stats.crc_errors = status.crc_errors;
    port.stats.mismatch_errors = status.mismatch_errors;
    port.stats.timeouts = status.timeouts;
}

fn func_write_single_register(
    cur: &mut Cursor,
    ctx: &mut ControlCtx,
    port: &mut Port,
    usb: Option<(&UsbEngine, &mut UsbContext)>,
) -> bool {
    if cur.read_remains() < 4 {
        cur.report_error(ctx, ModbusException::IllegalDataValue);
        return false;
    }
    let addr = cur.read_u16() as u32;
    let value = cur.read_u16() as u32;

    let mut persist = false;
    if ctx.state == ControlState::Init {
        if !check_holding_register_addr(addr) && addr != HREG_RESET_STATS {
            cur.report_error(ctx, ModbusException::IllegalDataAddress);
            return false;
        }
        if !check_holding_register_write(addr, value) {
            cur.report_error(ctx, ModbusException::SlaveDeviceFailure);
            return false;
        }

        ctx.need_set_port_params = set_holding_register(port, addr, value);
        persist = true;

        if ctx.need_set_port_params {
            if let Some((engine, usb_ctx)) = usb {
                if engine.submit_set_port_params(usb_ctx, ctx.for_port, &port.params) {
                    ctx.state = ControlState::UsbWrite;
                }
            }
            // USB not attached or not ready: the new parameters take effect
            // on reconnect.
        }
    }

    cur.write_u16(addr as u16);
    cur.write_u16(value as u16);
    ctx.state = ControlState::Done;
    persist
}

fn func_write_multiple_registers(
    cur: &mut Cursor,
    ctx: &mut ControlCtx,
    port: &mut Port,
    usb: Option<(&UsbEngine, &mut UsbContext)>,
) -> bool {
    if cur.read_remains() < 5 {
        cur.report_error(ctx, ModbusException::IllegalDataValue);
        return false;
    }
    let start = cur.read_u16() as u32;
    let count = cur.read_u16() as u32;
    let byte_count = cur.read_byte() as usize;
    if cur.read_remains() < byte_count || byte_count != 2 * count as usize {
        cur.report_error(ctx, ModbusException::IllegalDataValue);
        return false;
    }

    let mut persist = false;
    if ctx.state == ControlState::Init {
        let mut values = Vec::with_capacity(count as usize);
        for i in 0..count {
            if !check_holding_register_addr(start + i) {
                cur.report_error(ctx, ModbusException::IllegalDataAddress);
                return false;
            }
            values.push(cur.read_u16() as u32);
        }
        for (i, &v) in values.iter().enumerate() {
            if !check_holding_register_write(start + i as u32, v) {
                cur.report_error(ctx, ModbusException::SlaveDeviceFailure);
                return false;
            }
        }
        for (i, &v) in values.iter().enumerate() {
            if set_holding_register(port, start + i as u32, v) {
                ctx.need_set_port_params = true;
            }
        }
        persist = true;

        if ctx.need_set_port_params {
            if let Some((engine, usb_ctx)) = usb {
                if engine.submit_set_port_params(usb_ctx, ctx.for_port, &port.params) {
                    ctx.state = ControlState::UsbWrite;
                }
            }
        }
    }

    cur.write_u16(start as u16);
    cur.write_u16(count as u16);
    ctx.state = ControlState::Done;
    persist
}

/// Standard MODBUS device identification objects.
#[derive(Clone, Copy)]
enum StdIdent {
    VendorName,
    ProductCode,
    Revision,
    VendorUrl,
    ProductName,
    UserAppName,
}

const STD_IDENTS: [StdIdent; 6] = [
    StdIdent::VendorName,
    StdIdent::ProductCode,
    StdIdent::Revision,
    StdIdent::VendorUrl,
    StdIdent::ProductName,
    StdIdent::UserAppName,
];

const CUSTOM_SWITCH_NAME: u8 = 0x80;
const CUSTOM_HW_SERIAL_NUMBER: u8 = 0x81;
const CUSTOM_HW_REVISION: u8 = 0x82;
const CUSTOM_MAX: u8 = 0x83;

fn std_ident_string(id: StdIdent) -> Option<&'static str> {
    match id {
        StdIdent::VendorName => Some("United Computer Wizards"),
        StdIdent::ProductCode => Some("URS-485"),
        StdIdent::Revision => Some(env!("CARGO_PKG_VERSION")),
        StdIdent::VendorUrl => Some("https://www.ucw.cz/"),
        StdIdent::ProductName => Some("USB-to-RS485 Switch"),
        StdIdent::UserAppName => None,
    }
}

/// Holds the per-switch strings plugged into object IDs 0x80-0x82; owned by
/// whichever caller has a `&Switch` + `&UsbContext` at hand.
pub struct IdentitySource<'a> {
    pub switch_name: &'a str,
    pub hw_serial_number: &'a str,
    pub hw_revision: &'a str,
}

fn ident_string<'a>(id: u8, ident: &'a IdentitySource) -> Option<&'a str> {
    if (id as usize) < STD_IDENTS.len() {
        return std_ident_string(STD_IDENTS[id as usize]);
    }
    match id {
        CUSTOM_SWITCH_NAME => Some(ident.switch_name),
        CUSTOM_HW_SERIAL_NUMBER => Some(ident.hw_serial_number),
        CUSTOM_HW_REVISION => Some(ident.hw_revision),
        _ => None,
    }
}

fn ident_valid(id: u8) -> bool {
    ((id as usize) < STD_IDENTS.len() && std_ident_string(STD_IDENTS[id as usize]).is_some())
        || (CUSTOM_SWITCH_NAME..CUSTOM_MAX).contains(&id)
}

fn func_encapsulated_interface_transport(cur: &mut Cursor, ctx: &mut ControlCtx, ident: &IdentitySource) {
    if cur.read_remains() < 3 || cur.read_byte() != MODBUS_EIT_READ_DEVICE_IDENT {
        return cur.report_error(ctx, ModbusException::IllegalDataValue);
    }
    let action = cur.read_byte();
    let mut id = cur.read_byte();

    let (range_min, range_max) = match action {
        1 => (0u8, 2u8), // vendor name .. major/minor revision
        2 => (3u8, 5u8), // vendor url .. user app name
        3 => (CUSTOM_SWITCH_NAME, CUSTOM_MAX - 1),
        4 => {
            if ident_valid(id) {
                (id, id)
            } else {
                return cur.report_error(ctx, ModbusException::IllegalDataAddress);
            }
        }
        _ => return cur.report_error(ctx, ModbusException::IllegalDataValue),
    };

    if action != 4 && (id < range_min || id > range_max) {
        id = range_min;
    }

    cur.write_byte(MODBUS_EIT_READ_DEVICE_IDENT);
    cur.write_byte(action);
    cur.write_byte(0x83); // extended identification, stream + individual access

    let more_follows_at = cur.wpos;
    cur.write_byte(0); // more follows: not yet known
    cur.write_byte(0); // next object id: none yet
    cur.write_byte(0); // number of objects written so far

    let mut current = range_min;
    loop {
        if current > range_max {
            break;
        }
        let Some(s) = ident_string(current, ident) else {
            current += 1;
            continue;
        };
        let bytes = s.as_bytes();
        let mut len = bytes.len();
        let remains = cur.write_remains();
        if len + 2 > remains {
            if cur.reply[more_follows_at + 2] == 0 {
                // The only object so far: truncate it to fit.
                len = remains.saturating_sub(2);
            } else {
                cur.reply[more_follows_at] = 0xff;
                cur.reply[more_follows_at + 1] = current;
                break;
            }
        }
        cur.reply[more_follows_at + 2] += 1;
        cur.write_byte(current);
        cur.write_byte(len as u8);
        let start = cur.wpos;
        cur.reply[start..start + len].copy_from_slice(&bytes[..len]);
        cur.wpos += len;
        current += 1;
    }

    ctx.state = ControlState::Done;
}

/// Validates a freshly received control-port request and builds the
/// context used to process it, or rejects it immediately. The valid
/// slave-address range is `1..=8`; data ports only occupy 1-8.
pub fn submit_message(message: &mut crate::message::Message) -> Option<ControlCtx> {
    let slave_addr = message.unit();
    if !(1..=8).contains(&slave_addr) {
        message.set_error_reply(ModbusException::GatewayPathUnavailable);
        return None;
    }
    Some(ControlCtx::new(slave_addr))
}

/// Re-entrant: called once
/// when a control-port message is first scheduled and again whenever a
/// pending USB operation completes (`ctx.state` tells the function which).
pub fn process_message(
    port: &mut Port,
    ctx: &mut ControlCtx,
    usb: Option<(&UsbEngine, &mut UsbContext)>,
    ident: &IdentitySource,
    request: &[u8],
    request_len: usize,
    reply: &mut [u8; REQUEST_CAP],
) -> ControlStep {
    reply[0] = request[0];
    reply[1] = request[1];

    let mut cur = Cursor { request: &request[..request_len], rpos: 1, rend: request_len, reply, wpos: 2, wend: 2 + crate::message::MODBUS_MAX_DATA_SIZE };

    let func = cur.read_byte();
    let mut persist = false;
    match func {
        MODBUS_FUNC_READ_HOLDING_REGISTERS => func_read_registers(&mut cur, ctx, port, usb, true),
        MODBUS_FUNC_READ_INPUT_REGISTERS => func_read_registers(&mut cur, ctx, port, usb, false),
        MODBUS_FUNC_WRITE_SINGLE_REGISTER => persist = func_write_single_register(&mut cur, ctx, port, usb),
        MODBUS_FUNC_WRITE_MULTIPLE_REGISTERS => persist = func_write_multiple_registers(&mut cur, ctx, port, usb),
        MODBUS_FUNC_ENCAPSULATED_INTERFACE_TRANSPORT => func_encapsulated_interface_transport(&mut cur, ctx, ident),
        _ => cur.report_error(ctx, ModbusException::IllegalFunction),
    }

    ControlStep { reply_len: cur.wpos, persist }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ControlCtx;
    use crate::port::Port;

    fn ident() -> IdentitySource<'static> {
        IdentitySource { switch_name: "rack-a", hw_serial_number: "URS0001", hw_revision: "1" }
    }

    #[test]
    fn read_holding_baud_rate() {
        let mut port = Port::new(3);
        port.params.baud_rate = 19200;
        let mut ctx = ControlCtx::new(3);
        let request = [3u8, 3, 0, 1, 0, 1]; // unit=3 func=3 start=1 count=1
        let mut reply = [0u8; REQUEST_CAP];
        let step = process_message(&mut port, &mut ctx, None, &ident(), &request, request.len(), &mut reply);
        assert_eq!(&reply[..step.reply_len], &[3, 3, 2, 0, 192]);
    }

    #[test]
    fn write_single_register_rejects_bad_baud() {
        let mut port = Port::new(1);
        let mut ctx = ControlCtx::new(1);
        let request = [1u8, 6, 0, 1, 0xff, 0xff]; // value 65535, far above 1152
        let mut reply = [0u8; REQUEST_CAP];
        let step = process_message(&mut port, &mut ctx, None, &ident(), &request, request.len(), &mut reply);
        assert_eq!(reply[1], 6 | 0x80);
        assert_eq!(reply[2], ModbusException::SlaveDeviceFailure.code());
        assert_eq!(step.reply_len, 3);
    }

    #[test]
    fn reset_stats_requires_magic_value() {
        let mut port = Port::new(1);
        port.stats.broadcasts = 42;
        let mut ctx = ControlCtx::new(1);
        let request = [1u8, 6, 0x10, 0x00, 0xde, 0xad];
        let mut reply = [0u8; REQUEST_CAP];
        let _ = process_message(&mut port, &mut ctx, None, &ident(), &request, request.len(), &mut reply);
        assert_eq!(port.stats.broadcasts, 0);
    }

    #[test]
    fn unknown_function_is_illegal_function() {
        let mut port = Port::new(1);
        let mut ctx = ControlCtx::new(1);
        let request = [1u8, 99];
        let mut reply = [0u8; REQUEST_CAP];
        let step = process_message(&mut port, &mut ctx, None, &ident(), &request, request.len(), &mut reply);
        assert_eq!(reply[1], 99 | 0x80);
        assert_eq!(reply[2], ModbusException::IllegalFunction.code());
        assert_eq!(step.reply_len, 3);
    }
}
