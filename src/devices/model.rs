//! Device snapshot model: MAC identity, observed attributes, change-sets.

use std::collections::BTreeSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A normalized MAC address (`aa:bb:cc:dd:ee:ff`). The stable device identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    /// Parse any of `AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff`, `aabb.ccdd.eeff`
    /// or bare hex into the canonical lower-case colon form.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let hex: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect();
        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("Invalid MAC address: {raw}"));
        }
        let hex = hex.to_ascii_lowercase();
        let octets: Vec<&str> = (0..6).map(|i| &hex[i * 2..i * 2 + 2]).collect();
        Ok(Self(octets.join(":")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First three octets, upper-case (`00:1A:A0`), as used by vendor tables.
    pub fn oui(&self) -> String {
        self.0[..8].to_ascii_uppercase()
    }
}

impl TryFrom<String> for MacAddress {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for MacAddress {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Coarse device category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Unknown,
    Router,
    Printer,
    Server,
    Workstation,
    VirtualMachine,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Router => "router",
            Self::Printer => "printer",
            Self::Server => "server",
            Self::Workstation => "workstation",
            Self::VirtualMachine => "virtual_machine",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "router" => Ok(Self::Router),
            "printer" => Ok(Self::Printer),
            "server" => Ok(Self::Server),
            "workstation" => Ok(Self::Workstation),
            "virtual_machine" => Ok(Self::VirtualMachine),
            _ => Err(format!("Unknown device kind: {s}")),
        }
    }
}

/// One open service on a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub service: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl ServiceEntry {
    pub fn new(port: u16, protocol: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            port,
            protocol: protocol.into(),
            service: service.into(),
        }
    }
}

/// A device's observed attributes as of one scan report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub mac: MacAddress,
    pub ip: IpAddr,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default, rename = "device_type")]
    pub kind: DeviceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    /// Workers report this list as `ports`.
    #[serde(default, alias = "ports")]
    pub services: BTreeSet<ServiceEntry>,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

impl DeviceSnapshot {
    pub fn new(mac: MacAddress, ip: IpAddr) -> Self {
        Self {
            mac,
            ip,
            hostname: None,
            kind: DeviceKind::Unknown,
            vendor: None,
            services: BTreeSet::new(),
            last_seen: Utc::now(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_service(mut self, service: ServiceEntry) -> Self {
        self.services.insert(service);
        self
    }

    /// Whether the identity-independent attributes that matter for
    /// reconciliation (IP, hostname, service set) differ.
    pub fn differs_from(&self, other: &DeviceSnapshot) -> bool {
        self.ip != other.ip || self.hostname != other.hostname || self.services != other.services
    }
}

/// A persisted device: its latest snapshot within one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(rename = "location_id")]
    pub scope: String,
    #[serde(flatten)]
    pub snapshot: DeviceSnapshot,
    /// False once a later scan of the scope no longer saw the device.
    pub online: bool,
}

/// How a device moved between two reconciliations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceChange {
    New,
    Changed,
    Offline,
}

impl std::fmt::Display for DeviceChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => f.write_str("new"),
            Self::Changed => f.write_str("changed"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// The `new` / `changed` / `offline` partition produced by one reconciliation.
///
/// Lists are disjoint by MAC and sorted by MAC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub new: Vec<DeviceSnapshot>,
    pub changed: Vec<DeviceSnapshot>,
    pub offline: Vec<DeviceSnapshot>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.offline.is_empty()
    }

    pub fn len(&self) -> usize {
        self.new.len() + self.changed.len() + self.offline.len()
    }

    /// Every entry tagged with its bucket, in `new`, `changed`, `offline` order.
    pub fn entries(&self) -> impl Iterator<Item = (DeviceChange, &DeviceSnapshot)> {
        self.new
            .iter()
            .map(|d| (DeviceChange::New, d))
            .chain(self.changed.iter().map(|d| (DeviceChange::Changed, d)))
            .chain(self.offline.iter().map(|d| (DeviceChange::Offline, d)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_normalizes_separators_and_case() {
        let a = MacAddress::parse("AA-BB-CC-00-11-22").unwrap();
        let b = MacAddress::parse("aabb.cc00.1122").unwrap();
        let c = MacAddress::parse("aa:bb:cc:00:11:22").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.as_str(), "aa:bb:cc:00:11:22");
        assert_eq!(a.oui(), "AA:BB:CC");
    }

    #[test]
    fn mac_rejects_garbage() {
        assert!(MacAddress::parse("").is_err());
        assert!(MacAddress::parse("aa:bb:cc:dd:ee").is_err());
        assert!(MacAddress::parse("zz:bb:cc:dd:ee:ff").is_err());
    }

    #[test]
    fn snapshot_deserializes_worker_shape() {
        let json = r#"{
            "mac": "00:1A:A0:01:02:03",
            "ip": "192.168.1.20",
            "hostname": "build-srv",
            "services": [{"port": 22, "protocol": "tcp", "service": "ssh"}]
        }"#;
        let snap: DeviceSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snap.mac.as_str(), "00:1a:a0:01:02:03");
        assert_eq!(snap.kind, DeviceKind::Unknown);
        assert_eq!(snap.services.len(), 1);
    }

    #[test]
    fn differs_ignores_last_seen_and_kind() {
        let mac = MacAddress::parse("00:00:00:00:00:01").unwrap();
        let a = DeviceSnapshot::new(mac.clone(), "10.0.0.1".parse().unwrap());
        let mut b = a.clone();
        b.last_seen = a.last_seen + chrono::Duration::hours(1);
        b.kind = DeviceKind::Server;
        assert!(!a.differs_from(&b));

        b.ip = "10.0.0.2".parse().unwrap();
        assert!(a.differs_from(&b));
    }

    #[test]
    fn change_display() {
        assert_eq!(DeviceChange::Offline.to_string(), "offline");
        assert_eq!(DeviceKind::VirtualMachine.to_string(), "virtual_machine");
        assert_eq!("router".parse::<DeviceKind>().unwrap(), DeviceKind::Router);
    }
}
