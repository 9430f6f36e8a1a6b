//! The single-threaded cooperative reactor tying every other module
//! together: a `mio::Poll` event loop, a software timer wheel standing in
//! for a classic UCW-style `main_loop`: poll, then timers, USB events,
//! hotplug, and finally each switch's scheduler.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::client::{self, Client};
use crate::config::DaemonConfig;
use crate::control::{self, IdentitySource};
use crate::error::{DaemonError, ModbusException};
use crate::message::{MessageArena, MessageId};
use crate::persist;
use crate::port::NUM_PORTS;
use crate::switch::Switch;
use crate::timer::{TimerKind, TimerWheel};
use crate::usb::{HotplugOutcome, UsbEngine};

/// Upper bound on how long `Poll::poll` may block when at least one switch
/// has an attached USB device: `rusb`'s safe API only exposes synchronous
/// transfers, so bulk RX is polled opportunistically on a short cadence
/// rather than woken by a genuine completion event (see `src/usb/mod.rs`).
const USB_POLL_INTERVAL: Duration = Duration::from_millis(10);

const TOKEN_LISTENER_BASE: usize = 0;
const TOKEN_CLIENT_BASE: usize = 1_000;
const TOKEN_USB_BASE: usize = 1_000_000;

pub struct Daemon {
    poll: Poll,
    events: Events,
    config: DaemonConfig,
    switches: Vec<Switch>,
    arena: MessageArena,
    listeners: HashMap<Token, (usize, u8, TcpListener)>,
    clients: HashMap<u64, Client>,
    client_tokens: HashMap<Token, u64>,
    next_client_id: u64,
    timers: TimerWheel,
    usb: UsbEngine,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let poll = Poll::new().map_err(DaemonError::Poll)?;
        let usb = UsbEngine::new()?;

        let mut switches: Vec<Switch> = config.switches.iter().map(Switch::new).collect();
        if let Some(dir) = &config.persistent_dir {
            for switch in &mut switches {
                persist::load(switch, dir);
            }
        }

        let mut listeners = HashMap::new();
        for (switch_idx, (switch, cfg)) in switches.iter().zip(config.switches.iter()).enumerate() {
            for port_idx in 0..NUM_PORTS {
                let tcp_port = cfg.tcp_port_base + port_idx as u16;
                let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), tcp_port);
                let mut listener = TcpListener::bind(addr)
                    .map_err(|source| DaemonError::Listen { port: tcp_port, source })?;
                let token = Token(TOKEN_LISTENER_BASE + switch_idx * NUM_PORTS + port_idx);
                poll.registry()
                    .register(&mut listener, token, Interest::READABLE)
                    .map_err(DaemonError::Poll)?;
                info!("switch {}: listening on [::]:{tcp_port} for port {port_idx}", switch.name);
                listeners.insert(token, (switch_idx, port_idx as u8, listener));
            }
        }

        for pfd in usb.poll_fds() {
            let token = Token(TOKEN_USB_BASE + pfd.fd as usize);
            let mut source = mio::unix::SourceFd(&pfd.fd);
            // libusb's own poll() bitmask tells us which way to watch, but
            // since we never block the reactor on it (bulk transfers are
            // synchronous, see `USB_POLL_INTERVAL`), watching for both
            // directions is simplest and never wrong.
            let _ = poll.registry().register(&mut source, token, Interest::READABLE | Interest::WRITABLE);
        }

        Ok(Daemon {
            poll,
            events: Events::with_capacity(256),
            config,
            switches,
            arena: MessageArena::new(),
            listeners,
            clients: HashMap::new(),
            client_tokens: HashMap::new(),
            next_client_id: 1,
            timers: TimerWheel::new(),
            usb,
        })
    }

    pub fn run(&mut self) -> Result<(), DaemonError> {
        loop {
            self.tick()?;
        }
    }

    fn tick(&mut self) -> Result<(), DaemonError> {
        let any_usb_attached = self.switches.iter().any(|s| s.usb.is_some());
        let timeout = match self.timers.next_deadline() {
            Some(deadline) => {
                let until = deadline.saturating_duration_since(std::time::Instant::now());
                if any_usb_attached { until.min(USB_POLL_INTERVAL) } else { until }
            }
            None if any_usb_attached => USB_POLL_INTERVAL,
            None => Duration::from_secs(5),
        };

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(DaemonError::Poll(e)),
        }

        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for token in tokens {
            if token.0 >= TOKEN_USB_BASE {
                continue; // serviced in bulk below via usb.handle_events()
            } else if token.0 >= TOKEN_CLIENT_BASE {
                self.service_client(token);
            } else {
                self.service_listener(token);
            }
        }

        self.usb.handle_events();
        self.service_hotplug();

        for kind in self.timers.pop_expired() {
            self.service_timer(kind)?;
        }

        for idx in 0..self.switches.len() {
            self.service_usb(idx);
            self.run_scheduler(idx);
        }

        let disconnected: Vec<u64> =
            self.clients.iter().filter(|(_, c)| c.has_pending_writes()).map(|(id, _)| *id).collect();
        for id in disconnected {
            if let Some(client) = self.clients.get_mut(&id) {
                if let Err(e) = client.flush_writes() {
                    warn!("client {id}: write error: {e}");
                    self.drop_client(id);
                }
            }
        }

        Ok(())
    }

    fn service_listener(&mut self, token: Token) {
        let Some((switch_idx, port, listener)) = self.listeners.get(&token) else { return };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let id = self.next_client_id;
                    self.next_client_id += 1;
                    let client_token = Token(TOKEN_CLIENT_BASE + id as usize);
                    let mut stream = stream;
                    if let Err(e) =
                        self.poll.registry().register(&mut stream, client_token, Interest::READABLE | Interest::WRITABLE)
                    {
                        warn!("cannot register client socket: {e}");
                        continue;
                    }
                    info!("switch {}: new connection from {peer} for port {port}", self.switches[*switch_idx].name);
                    let mut client = Client::new(id, *switch_idx, *port, stream, client_token, peer.to_string());
                    client.touch_idle(&mut self.timers, Duration::from_secs(self.config.tcp_timeout));
                    self.clients.insert(id, client);
                    self.client_tokens.insert(client_token, id);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept error: {e}");
                    break;
                }
            }
        }
    }

    fn service_client(&mut self, token: Token) {
        let Some(&client_id) = self.client_tokens.get(&token) else { return };
        let Some(client) = self.clients.get_mut(&client_id) else { return };

        match client.on_readable(&mut self.arena) {
            Ok((new_ids, true)) => {
                if !new_ids.is_empty() {
                    let timeout = Duration::from_secs(self.config.tcp_timeout);
                    if let Some(client) = self.clients.get_mut(&client_id) {
                        client.touch_idle(&mut self.timers, timeout);
                    }
                    let switch_idx = self.arena.get(new_ids[0]).switch;
                    for id in new_ids {
                        let port = self.arena.get(id).port as usize;
                        self.switches[switch_idx].ports[port].ready.push_back(id);
                    }
                }
            }
            Ok((_, false)) => self.drop_client(client_id),
            Err(e) => {
                debug!("client {client_id}: {e}");
                self.drop_client(client_id);
            }
        }
    }

    fn drop_client(&mut self, client_id: u64) {
        let Some(mut client) = self.clients.remove(&client_id) else { return };
        self.client_tokens.remove(&client.token);
        if let Some(timer) = client.idle_timer.take() {
            self.timers.cancel(timer);
        }
        let _ = self.poll.registry().deregister(&mut client.stream);
        client::disconnect(&mut client, &mut self.switches[client.switch], &mut self.arena);
        info!("client {client_id}: disconnected");
    }

    fn service_hotplug(&mut self) {
        let switches = &self.switches;
        let outcomes = self.usb.drain_hotplug(|serial| {
            switches.iter().position(|s| s.serial.as_deref() == Some(serial)).or_else(|| {
                switches.iter().position(|s| s.serial.is_none())
            })
        });
        for outcome in outcomes {
            match outcome {
                HotplugOutcome::Attached { switch, ctx } => {
                    info!("switch {}: USB device attached", self.switches[switch].name);
                    self.switches[switch].usb = Some(ctx);
                }
                HotplugOutcome::Departed { bus, address } => {
                    for switch in &mut self.switches {
                        if let Some(usb) = &mut switch.usb {
                            if usb.bus == bus && usb.address == address {
                                warn!("switch {}: USB device departed", switch.name);
                                usb.bus = -1;
                                usb.address = -1;
                            }
                        }
                    }
                }
            }
        }
    }

    fn service_timer(&mut self, kind: TimerKind) -> Result<(), DaemonError> {
        match kind {
            TimerKind::Persist { switch } => {
                if let Some(dir) = self.config.persistent_dir.clone() {
                    self.switches[switch].persist_timer = None;
                    // A write failure here means the persistent directory is
                    // misconfigured (unwritable, wrong permissions, disk
                    // full); there is no sensible way to keep serving
                    // requests whose configuration changes cannot be saved.
                    persist::write(&self.switches[switch], &dir).map_err(DaemonError::Persist)?;
                }
            }
            TimerKind::ClientIdle { client } => {
                info!("client {client}: idle timeout");
                self.drop_client(client);
            }
            TimerKind::UsbReconnect { switch } => {
                if let Some(usb) = self.switches[switch].usb.as_mut() {
                    usb.reconnecting = false;
                }
            }
        }
        Ok(())
    }

    /// Runs the per-switch USB bookkeeping for one tick: polls bulk RX while
    /// working, drives the startup sequencer while configuring, and tears
    /// down a broken or departed device once its in-flight transfers have
    /// drained.
    fn service_usb(&mut self, idx: usize) {
        let Some(mut usb) = self.switches[idx].usb.take() else { return };

        let gone = usb.is_gone();
        let broken = matches!(usb.state, crate::usb::UsbState::Broken);
        if (gone || broken) && !usb.has_in_flight_transfers() {
            self.flush_broken(idx);
            if gone {
                // The device itself is gone; only a fresh hot-plug arrival
                // can bring this switch back.
                return;
            }
            usb.state = crate::usb::UsbState::Init;
            usb.reconnecting = true;
            self.timers.add(self.usb.reconnect_backoff(), TimerKind::UsbReconnect { switch: idx });
            self.switches[idx].usb = Some(usb);
            return;
        }
        if gone || broken {
            // Still waiting for in-flight transfers to drain.
            self.switches[idx].usb = Some(usb);
            return;
        }

        match usb.state {
            crate::usb::UsbState::Working => {
                let report = self.usb.poll_rx(&mut usb);
                for (usb_id, frame) in report.replies {
                    if let Some(msg_id) = self.switches[idx].find_busy_by_usb_id(usb_id, &self.arena) {
                        let m = self.arena.get_mut(msg_id);
                        let len = frame.len().min(m.reply.len());
                        m.reply[..len].copy_from_slice(&frame[..len]);
                        m.reply_len = len;
                        self.switches[idx].remove_busy(msg_id);
                        self.deliver_reply(msg_id);
                    }
                }
            }
            _ if usb.reconnecting => {
                // Waiting out the reconnect backoff; retried once the timer
                // above clears the flag.
            }
            _ => {
                let ports: [crate::port::PortParams; NUM_PORTS] =
                    std::array::from_fn(|i| self.switches[idx].ports[i].params.clone());
                let report = self.usb.drive_startup(&mut usb, &ports);
                if report.became_working {
                    info!("switch {}: USB device configured, now serving data ports", self.switches[idx].name);
                }
            }
        }

        self.switches[idx].usb = Some(usb);
    }

    /// Replies GATEWAY_PATH_UNAVAILABLE to every message still sitting in
    /// this switch's busy and control lists.
    fn flush_broken(&mut self, idx: usize) {
        let busy: Vec<MessageId> = self.switches[idx].busy.drain(..).collect();
        let control: Vec<MessageId> = self.switches[idx].control.drain(..).collect();
        for id in busy.into_iter().chain(control) {
            self.arena.get_mut(id).set_error_reply(ModbusException::GatewayPathUnavailable);
            self.deliver_reply(id);
        }
    }

    /// Moves a just-dispatched message from its owning client's `received`
    /// list to its `busy` list, so a later disconnect orphans it (via
    /// `client::disconnect`) instead of freeing it out from under the
    /// switch's busy/control list. A no-op for orphaned messages (no
    /// client) or clients that have already gone away.
    fn client_rx_to_busy(&mut self, id: MessageId) {
        let Some(client_id) = self.arena.get(id).client else { return };
        if let Some(client) = self.clients.get_mut(&client_id) {
            if let Some(pos) = client.rx.iter().position(|&x| x == id) {
                client.rx.remove(pos);
                client.busy.push(id);
            }
        }
    }

    /// Runs the control-queue drain and the round-robin USB scheduler for
    /// one switch, once per reactor tick.
    fn run_scheduler(&mut self, idx: usize) {
        while self.switches[idx].control_is_ready() {
            let Some(id) = self.switches[idx].ports[0].ready.pop_front() else { break };
            self.client_rx_to_busy(id);
            let Some(ctx) = control::submit_message(self.arena.get_mut(id)) else {
                self.deliver_reply(id);
                continue;
            };
            self.arena.get_mut(id).ctrl = Some(ctx);
            self.switches[idx].control.push(id);
            self.process_control(idx, id);
        }

        while self.switches[idx].usb_is_ready() {
            let Some(id) = self.switches[idx].take_next_ready() else { break };
            self.client_rx_to_busy(id);
            self.switches[idx].busy.push(id);

            let Some(mut usb) = self.switches[idx].usb.take() else {
                let m = self.arena.get_mut(id);
                m.set_error_reply(ModbusException::GatewayPathUnavailable);
                self.switches[idx].remove_busy(id);
                self.deliver_reply(id);
                continue;
            };

            self.arena.get_mut(id).generation = usb.generation;
            let busy_ids: Vec<MessageId> = self.switches[idx].busy.clone();
            let msg_id = self.usb.next_message_id(&mut usb, |candidate| {
                busy_ids.iter().any(|&b| self.arena.get(b).usb_message_id == candidate)
            });
            self.arena.get_mut(id).usb_message_id = msg_id;
            // Message::port is the 1-based data-port index (1..=8); the
            // wire format wants it 0-based, like every other USB-facing
            // call (GET_PORT_STATUS/SET_PORT_PARAMS's `wIndex`).
            let port = self.arena.get(id).port - 1;
            let request = self.arena.get(id).request_pdu().to_vec();

            if !self.usb.submit_tx(&mut usb, port, msg_id, &request) {
                // `submit_tx` already marked the context Broken; leave the
                // message on the busy list and let the next tick's deferred
                // teardown (`flush_broken`) reply to it along with anything
                // else still in flight.
                self.switches[idx].usb = Some(usb);
                continue;
            }
            self.switches[idx].usb = Some(usb);
        }
    }

    fn process_control(&mut self, idx: usize, id: MessageId) {
        let switch_name = self.switches[idx].name.clone();
        let hw_serial = self.switches[idx].usb.as_ref().map(|u| u.serial_number.clone()).unwrap_or_default();
        let hw_revision = self.switches[idx].usb.as_ref().map(|u| u.hw_revision.clone()).unwrap_or_default();
        let ident = IdentitySource { switch_name: &switch_name, hw_serial_number: &hw_serial, hw_revision: &hw_revision };

        let port_num = self.arena.get(id).ctrl.as_ref().unwrap().for_port;
        let mut ctx = self.arena.get_mut(id).ctrl.take().unwrap();
        let step = {
            let switch = &mut self.switches[idx];
            let port = &mut switch.ports[port_num as usize];
            let usb_pair = switch.usb.as_mut().map(|u| (&self.usb, u));
            let msg = self.arena.get(id);
            let request = msg.request;
            let request_len = msg.request_len;
            let mut reply = [0u8; crate::message::REQUEST_CAP];
            let step = control::process_message(port, &mut ctx, usb_pair, &ident, &request, request_len, &mut reply);
            let m = self.arena.get_mut(id);
            m.reply = reply;
            step
        };

        self.arena.get_mut(id).ctrl = Some(ctx);
        let m = self.arena.get_mut(id);
        m.reply_len = step.reply_len;

        if step.persist {
            persist::schedule_write(&mut self.switches[idx], idx, self.config.persistent_dir.as_deref(), &mut self.timers);
        }

        if let Some(pos) = self.switches[idx].control.iter().position(|&x| x == id) {
            self.switches[idx].control.swap_remove(pos);
        }
        self.deliver_reply(id);
    }

    /// Writes a finished message's reply to its client (if any), silently
    /// drops broadcasts and orphans, and frees the arena slot.
    fn deliver_reply(&mut self, id: MessageId) {
        let msg = self.arena.get(id);
        if msg.is_broadcast() {
            self.arena.free(id);
            return;
        }
        match msg.client {
            None => self.arena.free(id),
            Some(client_id) => {
                let transaction_id = msg.client_transaction_id;
                let reply = msg.reply[..msg.reply_len].to_vec();
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.queue_reply(transaction_id, &reply);
                    if let Some(pos) = client.busy.iter().position(|&x| x == id) {
                        client.busy.swap_remove(pos);
                    }
                }
                self.arena.free(id);
            }
        }
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/urs485/config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::SwitchConfig;
    use mio::net::TcpStream as MioTcpStream;

    fn test_config(tcp_port_base: u16) -> DaemonConfig {
        DaemonConfig {
            switches: vec![SwitchConfig { name: "test".into(), serial: None, tcp_port_base }],
            log_stream: None,
            tcp_timeout: 60,
            max_queued_messages: 64,
            persistent_dir: None,
        }
    }

    /// A placeholder socket for bookkeeping-only tests: connects to one of
    /// the daemon's own freshly bound listeners. Never polled or written
    /// to; it only needs to be a valid `TcpStream` for `Client::new`.
    fn dummy_client(daemon: &Daemon, id: u64, switch: usize, port: u8) -> Client {
        let (_, _, listener) = daemon.listeners.values().next().expect("daemon has listeners");
        let bound_port = listener.local_addr().unwrap().port();
        let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), bound_port);
        let stream = MioTcpStream::connect(addr).expect("connect to own listener");
        Client::new(id, switch, port, stream, Token(0), "test-peer".into())
    }

    /// A client that disconnects after the scheduler has already moved its
    /// message onto the switch's busy list (simulating a request in flight
    /// over USB) must orphan that message, not free it out from under the
    /// busy list.
    #[test]
    fn disconnect_while_in_flight_orphans_message_without_dangling_id() {
        let mut daemon = Daemon::new(test_config(18471)).expect("daemon starts");
        let id = daemon.arena.alloc(0, 1, 1);
        {
            let m = daemon.arena.get_mut(id);
            m.client_transaction_id = 0x99;
            m.request[0] = 1;
            m.request[1] = 3;
            m.request_len = 2;
        }

        let mut client = dummy_client(&daemon, 1, 0, 1);
        client.rx.push(id);
        daemon.clients.insert(1, client);

        // What `run_scheduler` does on dispatch: move the id out of the
        // client's received list and onto both the switch's busy list and
        // the client's own busy list.
        daemon.client_rx_to_busy(id);
        daemon.switches[0].busy.push(id);

        assert!(daemon.clients[&1].busy.contains(&id));
        assert!(!daemon.clients[&1].rx.contains(&id));

        let mut client = daemon.clients.remove(&1).unwrap();
        crate::client::disconnect(&mut client, &mut daemon.switches[0], &mut daemon.arena);

        assert!(daemon.switches[0].orphaned.contains(&id));
        assert!(!daemon.switches[0].busy.contains(&id));
        assert_eq!(daemon.arena.get(id).client, None);
    }

    /// A message dispatched to the control processor or to USB, still
    /// sitting in the client's *received* list because the scheduler never
    /// ran, must be freed (not leaked) when its client disconnects.
    #[test]
    fn disconnect_before_dispatch_frees_unprocessed_message() {
        let mut daemon = Daemon::new(test_config(18472)).expect("daemon starts");
        let id = daemon.arena.alloc(0, 1, 1);

        let mut client = dummy_client(&daemon, 1, 0, 1);
        client.rx.push(id);
        daemon.switches[0].ports[1].ready.push_back(id);
        daemon.clients.insert(1, client);

        let mut client = daemon.clients.remove(&1).unwrap();
        crate::client::disconnect(&mut client, &mut daemon.switches[0], &mut daemon.arena);

        assert!(daemon.switches[0].ports[1].ready.is_empty());
        assert!(!daemon.switches[0].orphaned.contains(&id));
    }

    /// A USB departure (or any other reason a switch is torn down) must
    /// flush every message still on its busy and control lists with
    /// GATEWAY_PATH_UNAVAILABLE and actually deliver that reply to each
    /// owning client.
    #[test]
    fn usb_departure_flushes_busy_and_control_messages() {
        let mut daemon = Daemon::new(test_config(18481)).expect("daemon starts");

        let busy_id = daemon.arena.alloc(0, 1, 1);
        {
            let m = daemon.arena.get_mut(busy_id);
            m.client_transaction_id = 0x10;
            m.request[0] = 1;
            m.request[1] = 3;
            m.request_len = 2;
        }
        let ctrl_id = daemon.arena.alloc(0, 2, 0);
        {
            let m = daemon.arena.get_mut(ctrl_id);
            m.client_transaction_id = 0x20;
            m.request[0] = 3;
            m.request[1] = 4;
            m.request_len = 2;
        }

        let mut data_client = dummy_client(&daemon, 1, 0, 1);
        data_client.busy.push(busy_id);
        let mut ctrl_client = dummy_client(&daemon, 2, 0, 0);
        ctrl_client.busy.push(ctrl_id);
        daemon.clients.insert(1, data_client);
        daemon.clients.insert(2, ctrl_client);

        daemon.switches[0].busy.push(busy_id);
        daemon.switches[0].control.push(ctrl_id);

        daemon.flush_broken(0);

        assert!(daemon.switches[0].busy.is_empty());
        assert!(daemon.switches[0].control.is_empty());
        // Both clients got a reply queued and their busy bookkeeping
        // cleared; the arena slots were freed as part of delivery.
        assert!(daemon.clients[&1].has_pending_writes());
        assert!(daemon.clients[&2].has_pending_writes());
        assert!(daemon.clients[&1].busy.is_empty());
        assert!(daemon.clients[&2].busy.is_empty());
    }
}
