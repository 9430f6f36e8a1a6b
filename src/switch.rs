//! A single physical USB-RS485 switch: nine ports, the aggregate message
//! lists and the attached USB context.

use crate::config::SwitchConfig;
use crate::message::MessageId;
use crate::port::{Port, NUM_PORTS};
use crate::timer::TimerId;
use crate::usb::UsbContext;

pub struct Switch {
    pub name: String,
    pub serial: Option<String>,
    pub tcp_port_base: u16,
    pub ports: [Port; NUM_PORTS],

    /// Sent over USB, waiting for a reply.
    pub busy: Vec<MessageId>,
    /// At most one message in flight at the control processor.
    pub control: Vec<MessageId>,
    /// Messages whose client disconnected while still in flight.
    pub orphaned: Vec<MessageId>,

    pub usb: Option<UsbContext>,
    pub persist_timer: Option<TimerId>,

    /// Round-robin cursor over data ports 1..=8, preserved across scheduler
    /// invocations so no port is starved.
    pub robin: u8,
}

impl Switch {
    pub fn new(cfg: &SwitchConfig) -> Self {
        let ports = std::array::from_fn(|i| Port::new(i as u8));
        Switch {
            name: cfg.name.clone(),
            serial: cfg.serial.clone(),
            tcp_port_base: cfg.tcp_port_base,
            ports,
            busy: Vec::new(),
            control: Vec::new(),
            orphaned: Vec::new(),
            usb: None,
            persist_timer: None,
            robin: 1,
        }
    }

    /// The control processor handles one request at a time.
    pub fn control_is_ready(&self) -> bool {
        self.control.is_empty()
    }

    /// Either there's no attached USB context (in which case requests are
    /// rejected immediately with an error reply so they never pile up) or
    /// the TX path genuinely has room.
    pub fn usb_is_ready(&self) -> bool {
        match &self.usb {
            None => true,
            Some(u) => u.tx_is_ready(),
        }
    }

    /// Removes and returns the next data-port message to dispatch, advancing
    /// the round-robin cursor over ports 1..=8.
    pub fn take_next_ready(&mut self) -> Option<MessageId> {
        let data_ports = NUM_PORTS - 1;
        for _ in 0..data_ports {
            self.robin += 1;
            if self.robin as usize == NUM_PORTS {
                self.robin = 1;
            }
            let port = &mut self.ports[self.robin as usize];
            if let Some(id) = port.ready.pop_front() {
                return Some(id);
            }
        }
        None
    }

    pub fn find_busy_by_usb_id(&self, usb_message_id: u16, arena: &crate::message::MessageArena) -> Option<MessageId> {
        self.busy.iter().copied().find(|&id| arena.get(id).usb_message_id == usb_message_id)
    }

    pub fn remove_busy(&mut self, id: MessageId) {
        if let Some(pos) = self.busy.iter().position(|&x| x == id) {
            self.busy.swap_remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SwitchConfig {
        SwitchConfig { name: "s".into(), serial: None, tcp_port_base: 4300 }
    }

    #[test]
    fn round_robin_visits_all_data_ports_before_repeating() {
        let mut sw = Switch::new(&cfg());
        let mut arena = crate::message::MessageArena::new();
        let mut ids = Vec::new();
        for p in 1..=8u8 {
            let id = arena.alloc(0, 1, p);
            sw.ports[p as usize].ready.push_back(id);
            ids.push(id);
        }
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(sw.take_next_ready().unwrap());
        }
        seen.sort();
        let mut expect = ids.clone();
        expect.sort();
        assert_eq!(seen, expect);
        assert!(sw.take_next_ready().is_none());
    }

    #[test]
    fn round_robin_does_not_starve_a_single_busy_port() {
        // Port 1 always has work; port 5 gets one message. The robin index
        // must still reach port 5 instead of looping forever on port 1.
        let mut sw = Switch::new(&cfg());
        let mut arena = crate::message::MessageArena::new();
        let id5 = arena.alloc(0, 1, 5);
        sw.ports[5].ready.push_back(id5);
        for p in [1u8, 1, 1] {
            let id = arena.alloc(0, 1, p);
            sw.ports[p as usize].ready.push_back(id);
        }
        let mut found5 = false;
        for _ in 0..4 {
            if let Some(id) = sw.take_next_ready() {
                if id == id5 {
                    found5 = true;
                }
            }
        }
        assert!(found5);
    }
}
