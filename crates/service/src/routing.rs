//! Route table: parse entries, expand port/host ranges, answer
//! `(host, port) -> (action, mode, password?)` lookups. Default-deny on
//! miss; later entries override earlier ones for the same expanded key.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Any,
    Ni,
    Raw,
}

impl Mode {
    /// `entry mode != any && entry mode != request talk_mode` is a mismatch.
    pub fn mismatches(&self, requested: Mode) -> bool {
        *self != Mode::Any && *self != requested
    }
}

#[derive(Debug)]
pub enum RouteEntryError {
    InvalidAction(String),
    InvalidMode(String),
    InvalidPort(String),
    Malformed(String),
}

impl std::error::Error for RouteEntryError {}

impl std::fmt::Display for RouteEntryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAction(s) => write!(f, "invalid action {s:?}"),
            Self::InvalidMode(s) => write!(f, "invalid mode {s:?}"),
            Self::InvalidPort(s) => write!(f, "invalid port specification {s:?}"),
            Self::Malformed(s) => write!(f, "malformed route table entry {s:?}"),
        }
    }
}

/// A single parsed, not-yet-expanded route table entry.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub action: Action,
    pub mode: Mode,
    pub target: String,
    pub port: String,
    pub password: Option<String>,
}

/// The structured config form of a route entry, the `serde` counterpart of
/// the comma-separated string form.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteEntryConfig {
    pub action: String,
    pub mode: String,
    pub target: String,
    pub port: String,
    #[serde(default)]
    pub password: Option<String>,
}

/// Parses the string form `"action,mode,target,port,password"` (password
/// may be omitted entirely, or present-but-empty which maps to `None`).
pub fn parse_route_entry(entry: &str) -> Result<RouteEntry, RouteEntryError> {
    let fields: Vec<&str> = entry.splitn(5, ',').collect();
    if fields.len() < 4 {
        return Err(RouteEntryError::Malformed(entry.to_string()));
    }

    let action = parse_action(fields[0])?;
    let mode = parse_mode(fields[1])?;
    let target = fields[2].to_string();
    let port = fields[3].to_string();
    let password = fields
        .get(4)
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty());

    Ok(RouteEntry {
        action,
        mode,
        target,
        port,
        password,
    })
}

pub fn parse_route_entry_config(cfg: &RouteEntryConfig) -> Result<RouteEntry, RouteEntryError> {
    Ok(RouteEntry {
        action: parse_action(&cfg.action)?,
        mode: parse_mode(&cfg.mode)?,
        target: cfg.target.clone(),
        port: cfg.port.clone(),
        password: cfg.password.clone().filter(|s| !s.is_empty()),
    })
}

fn parse_action(s: &str) -> Result<Action, RouteEntryError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "allow" => Ok(Action::Allow),
        "deny" => Ok(Action::Deny),
        other => Err(RouteEntryError::InvalidAction(other.to_string())),
    }
}

fn parse_mode(s: &str) -> Result<Mode, RouteEntryError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "any" => Ok(Mode::Any),
        "ni" => Ok(Mode::Ni),
        "raw" => Ok(Mode::Raw),
        other => Err(RouteEntryError::InvalidMode(other.to_string())),
    }
}

/// Expands a `"N"` or `"N-M"` (inclusive) port specification.
pub fn parse_target_ports(ports: &str) -> Result<Vec<u16>, RouteEntryError> {
    let ports = ports.trim();
    if let Some((begin, end)) = ports.split_once('-') {
        let begin: u16 = begin
            .trim()
            .parse()
            .map_err(|_| RouteEntryError::InvalidPort(ports.to_string()))?;
        let end: u16 = end
            .trim()
            .parse()
            .map_err(|_| RouteEntryError::InvalidPort(ports.to_string()))?;
        if begin > end {
            return Err(RouteEntryError::InvalidPort(ports.to_string()));
        }
        Ok((begin..=end).collect())
    } else {
        let port: u16 = ports
            .parse()
            .map_err(|_| RouteEntryError::InvalidPort(ports.to_string()))?;
        Ok(vec![port])
    }
}

/// Expands a single host, an `a.b.c.d-e.f.g.h` IPv4 range, or a CIDR block
/// into its literal host strings. Hosts that parse as neither an IPv4
/// literal nor a range nor a CIDR are passed through unchanged (DNS names),
/// matching the original's "no netaddr available" fallback of yielding the
/// host literally.
pub fn parse_target_hosts(hosts: &str) -> Vec<String> {
    let hosts = hosts.trim();

    if let Some((start, end)) = hosts.split_once('-') {
        if let (Ok(start), Ok(end)) = (start.parse::<Ipv4Addr>(), end.parse::<Ipv4Addr>()) {
            return ipv4_range(start, end);
        }
    }

    if let Some((addr, prefix)) = hosts.split_once('/') {
        if let (Ok(addr), Ok(prefix)) = (addr.parse::<Ipv4Addr>(), prefix.parse::<u32>()) {
            if prefix <= 32 {
                return cidr_range(addr, prefix);
            }
        }
    }

    vec![hosts.to_string()]
}

fn ipv4_range(start: Ipv4Addr, end: Ipv4Addr) -> Vec<String> {
    let start = u32::from(start);
    let end = u32::from(end);
    if start > end {
        return Vec::new();
    }
    (start..=end).map(|n| Ipv4Addr::from(n).to_string()).collect()
}

fn cidr_range(addr: Ipv4Addr, prefix: u32) -> Vec<String> {
    let mask: u32 = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    let base = u32::from(addr) & mask;
    let host_bits = 32 - prefix;
    let count: u64 = 1u64 << host_bits;
    (0..count)
        .map(|i| Ipv4Addr::from(base + i as u32).to_string())
        .collect()
}

/// The expanded `(host, port) -> (action, mode, password?)` lookup table.
/// Immutable after `build`; lookups take no lock.
#[derive(Debug, Default)]
pub struct RouteTable {
    table: HashMap<(String, u16), (Action, Mode, Option<String>)>,
}

impl RouteTable {
    /// Builds a table from raw string-form entries. A parse error on a
    /// single entry is logged and that entry is skipped; table construction
    /// never aborts.
    pub fn build(entries: &[String]) -> Self {
        let mut table = HashMap::new();
        for raw in entries {
            match parse_route_entry(raw) {
                Ok(entry) => insert_entry(&mut table, &entry),
                Err(e) => log::warn!("skipping invalid route table entry {raw:?}: {e}"),
            }
        }
        Self { table }
    }

    pub fn build_from_parsed(entries: &[RouteEntry]) -> Self {
        let mut table = HashMap::new();
        for entry in entries {
            insert_entry(&mut table, entry);
        }
        Self { table }
    }

    /// Returns `(action, mode, password?)`, defaulting to
    /// `(deny, any, None)` on a miss.
    pub fn lookup(&self, host: &str, port: u16) -> (Action, Mode, Option<String>) {
        self.table
            .get(&(host.to_string(), port))
            .cloned()
            .unwrap_or((Action::Deny, Mode::Any, None))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

fn insert_entry(table: &mut HashMap<(String, u16), (Action, Mode, Option<String>)>, entry: &RouteEntry) {
    let ports = match parse_target_ports(&entry.port) {
        Ok(p) => p,
        Err(e) => {
            log::warn!("skipping route table entry with bad port {:?}: {e}", entry.port);
            return;
        }
    };
    let hosts = parse_target_hosts(&entry.target);

    for host in &hosts {
        for &port in &ports {
            table.insert(
                (host.clone(), port),
                (entry.action, entry.mode, entry.password.clone()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_deny_on_miss() {
        let table = RouteTable::build(&[]);
        assert_eq!(
            table.lookup("10.0.0.1", 3200),
            (Action::Deny, Mode::Any, None)
        );
    }

    #[test]
    fn port_range_expands_inclusive() {
        let table = RouteTable::build(&["allow,ni,10.0.0.1,3200-3202,".to_string()]);
        for port in 3200..=3202 {
            let (action, mode, _) = table.lookup("10.0.0.1", port);
            assert_eq!(action, Action::Allow);
            assert_eq!(mode, Mode::Ni);
        }
        assert_eq!(table.lookup("10.0.0.1", 3203).0, Action::Deny);
    }

    #[test]
    fn password_is_none_when_omitted() {
        let table = RouteTable::build(&["allow,any,10.0.0.1,3200,".to_string()]);
        assert_eq!(table.lookup("10.0.0.1", 3200).2, None);
    }

    #[test]
    fn password_is_preserved_when_present() {
        let table = RouteTable::build(&["allow,ni,10.0.0.1,3200,secret".to_string()]);
        assert_eq!(table.lookup("10.0.0.1", 3200).2.as_deref(), Some("secret"));
    }

    #[test]
    fn later_entries_override_earlier() {
        let table = RouteTable::build(&[
            "allow,ni,10.0.0.1,3200,".to_string(),
            "deny,any,10.0.0.1,3200,".to_string(),
        ]);
        assert_eq!(table.lookup("10.0.0.1", 3200).0, Action::Deny);
    }

    #[test]
    fn invalid_entry_is_skipped_not_fatal() {
        let table = RouteTable::build(&[
            "bogus,ni,10.0.0.1,3200,".to_string(),
            "allow,ni,10.0.0.2,3200,".to_string(),
        ]);
        assert_eq!(table.lookup("10.0.0.1", 3200).0, Action::Deny);
        assert_eq!(table.lookup("10.0.0.2", 3200).0, Action::Allow);
    }

    #[test]
    fn mode_mismatch_detection() {
        assert!(Mode::Ni.mismatches(Mode::Raw));
        assert!(!Mode::Any.mismatches(Mode::Raw));
        assert!(!Mode::Ni.mismatches(Mode::Ni));
    }

    #[test]
    fn ipv4_range_expansion() {
        let hosts = parse_target_hosts("10.0.0.1-10.0.0.3");
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn cidr_expansion() {
        let hosts = parse_target_hosts("10.0.0.0/30");
        assert_eq!(
            hosts,
            vec!["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
    }

    #[test]
    fn dns_name_passes_through() {
        let hosts = parse_target_hosts("internal.example.com");
        assert_eq!(hosts, vec!["internal.example.com"]);
    }
}
