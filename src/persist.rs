//! Persistence adapter: debounced, atomic-rename text files holding each
//! switch's port settings.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};

use crate::port::Parity;
use crate::switch::Switch;
use crate::timer::{TimerKind, TimerWheel};

pub const DEBOUNCE: Duration = Duration::from_secs(1);

fn path_for(dir: &Path, switch_name: &str) -> PathBuf {
    dir.join(switch_name)
}

/// Schedules a debounced write for `switch_index` 1 second from now, unless
/// one is already pending. A no-op if no persistent directory is
/// configured.
pub fn schedule_write(switch: &mut Switch, switch_index: usize, dir: Option<&Path>, wheel: &mut TimerWheel) {
    if dir.is_none() {
        return;
    }
    if switch.persist_timer.is_some() {
        return;
    }
    switch.persist_timer = Some(wheel.add(DEBOUNCE, TimerKind::Persist { switch: switch_index }));
}

/// Writes the current port settings for one switch to `<dir>/<name>`,
/// through a `.new` temp file and a rename so readers never observe a
/// partial write.
pub fn write(switch: &Switch, dir: &Path) -> std::io::Result<()> {
    let filename = path_for(dir, &switch.name);
    let tmpname = filename.with_extension("new");

    let mut out = String::new();
    out.push_str("# baud parity powered timeout\n");
    out.push_str("# >description\n");
    for port in &switch.ports[1..] {
        let p = &port.params;
        out.push_str(&format!("{} {} {} {}\n", p.baud_rate, p.parity, p.powered, p.request_timeout_ms));
        out.push('>');
        out.push_str(&String::from_utf8_lossy(&p.description));
        out.push('\n');
    }

    {
        let mut f = fs::File::create(&tmpname)?;
        f.write_all(out.as_bytes())?;
    }
    fs::rename(&tmpname, &filename)?;
    debug!("switch {}: wrote persistent settings to {}", switch.name, filename.display());
    Ok(())
}

/// Loads `<dir>/<name>` into `switch`'s ports, tolerating a missing file
/// (a switch seen for the first time has none yet). A malformed file is
/// logged and otherwise ignored rather than aborting the daemon, since
/// other switches may already be running on the reactor.
pub fn load(switch: &mut Switch, dir: &Path) {
    let filename = path_for(dir, &switch.name);
    let text = match fs::read_to_string(&filename) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("switch {}: no persistent settings at {}", switch.name, filename.display());
            return;
        }
        Err(e) => {
            warn!("switch {}: cannot read {}: {e}", switch.name, filename.display());
            return;
        }
    };

    info!("switch {}: loading persistent settings from {}", switch.name, filename.display());

    let mut port_index = 1usize;
    for (lineno, line) in text.lines().enumerate() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(desc) = line.strip_prefix('>') {
            if port_index <= 1 {
                warn!("switch {}: {}:{}: description before any port settings", switch.name, filename.display(), lineno + 1);
                continue;
            }
            switch.ports[port_index - 1].params.set_description(desc);
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let (Some(baud), Some(parity), Some(powered), Some(timeout)) = (
            fields.get(0).and_then(|s| s.parse::<u32>().ok()),
            fields.get(1).and_then(|s| s.parse::<u8>().ok()),
            fields.get(2).and_then(|s| s.parse::<u8>().ok()),
            fields.get(3).and_then(|s| s.parse::<u16>().ok()),
        ) else {
            warn!("switch {}: {}:{}: parse error", switch.name, filename.display(), lineno + 1);
            continue;
        };
        if port_index >= switch.ports.len() {
            warn!("switch {}: {}: too many ports", switch.name, filename.display());
            break;
        }
        if Parity::from_u16(parity as u16).is_none() {
            warn!("switch {}: {}:{}: invalid parity {parity}", switch.name, filename.display(), lineno + 1);
            continue;
        }
        let port = &mut switch.ports[port_index];
        port.params.baud_rate = baud;
        port.params.parity = parity;
        port.params.powered = powered;
        port.params.request_timeout_ms = timeout;
        port_index += 1;
    }

    if port_index != switch.ports.len() {
        warn!(
            "switch {}: {} lines covered fewer than {} ports",
            switch.name,
            filename.display(),
            switch.ports.len() - 1
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitchConfig;
    use tempfile::tempdir;

    fn cfg() -> SwitchConfig {
        SwitchConfig { name: "rack-a".into(), serial: None, tcp_port_base: 4300 }
    }

    #[test]
    fn round_trips_port_settings() {
        let dir = tempdir().unwrap();
        let mut sw = Switch::new(&cfg());
        sw.ports[3].params.baud_rate = 9600;
        sw.ports[3].params.parity = 1;
        sw.ports[3].params.powered = 1;
        sw.ports[3].params.request_timeout_ms = 2000;
        sw.ports[3].params.set_description("pump");

        write(&sw, dir.path()).unwrap();

        let mut sw2 = Switch::new(&cfg());
        load(&mut sw2, dir.path());
        assert_eq!(sw2.ports[3].params.baud_rate, 9600);
        assert_eq!(sw2.ports[3].params.parity, 1);
        assert_eq!(sw2.ports[3].params.powered, 1);
        assert_eq!(sw2.ports[3].params.request_timeout_ms, 2000);
        assert_eq!(&sw2.ports[3].params.description, b"pump    ");
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        let mut sw = Switch::new(&cfg());
        load(&mut sw, dir.path()); // must not panic
        assert_eq!(sw.ports[1].params.baud_rate, 19200);
    }

    #[test]
    fn comments_and_blanks_are_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rack-a");
        let mut body = String::from("# baud parity powered timeout\n\n");
        for _ in 1..9 {
            body.push_str("9600 0 0 1000\n>        \n");
        }
        fs::write(&path, body).unwrap();

        let mut sw = Switch::new(&cfg());
        load(&mut sw, dir.path());
        assert_eq!(sw.ports[1].params.baud_rate, 9600);
        assert_eq!(sw.ports[8].params.baud_rate, 9600);
    }
}
