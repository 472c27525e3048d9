//! Device recognition. Fills in vendor and kind for reported devices.
//!
//! Applied to a report before reconciliation. Lookup order: MAC vendor prefix,
//! hostname pattern, then required service sets. The worker's own
//! classification is kept when it supplied one.

use regex::Regex;

use super::model::{DeviceKind, DeviceSnapshot};

struct VendorPrefix {
    oui: &'static str,
    vendor: &'static str,
    /// Virtualization vendors identify the kind outright.
    kind: Option<DeviceKind>,
}

const VENDOR_PREFIXES: &[VendorPrefix] = &[
    VendorPrefix { oui: "00:00:0C", vendor: "Cisco", kind: None },
    VendorPrefix { oui: "00:1A:A0", vendor: "Dell", kind: None },
    VendorPrefix { oui: "00:14:22", vendor: "Dell", kind: None },
    VendorPrefix { oui: "00:50:56", vendor: "VMware", kind: Some(DeviceKind::VirtualMachine) },
    VendorPrefix { oui: "00:05:69", vendor: "VMware", kind: Some(DeviceKind::VirtualMachine) },
    VendorPrefix { oui: "00:1C:42", vendor: "Parallels", kind: Some(DeviceKind::VirtualMachine) },
];

const HOSTNAME_PATTERNS: &[(DeviceKind, &str)] = &[
    (DeviceKind::Printer, r"(?i)print"),
    (DeviceKind::Router, r"(?i)router|gateway|(^|[-_.])ap([-_.0-9]|$)"),
    (DeviceKind::Server, r"(?i)srv|server"),
    (DeviceKind::Workstation, r"(?i)pc|laptop|desktop"),
];

/// Every (port, service-substring) pair must be present for the kind to match.
const SERVICE_PATTERNS: &[(DeviceKind, &[(u16, &str)])] = &[
    (DeviceKind::Printer, &[(631, "ipp")]),
    (DeviceKind::Router, &[(80, "http"), (443, "https"), (53, "domain")]),
    (DeviceKind::Server, &[(22, "ssh"), (3389, "ms-wbt-server")]),
];

/// Rule-based device classifier. Build once, share freely.
pub struct DeviceRecognizer {
    hostname_rules: Vec<(DeviceKind, Regex)>,
}

impl Default for DeviceRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRecognizer {
    pub fn new() -> Self {
        let hostname_rules = HOSTNAME_PATTERNS
            .iter()
            .filter_map(|(kind, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((*kind, re)),
                Err(e) => {
                    tracing::warn!(pattern, error = %e, "Skipping invalid hostname rule");
                    None
                }
            })
            .collect();
        Self { hostname_rules }
    }

    /// Vendor name for a device's MAC prefix, if known.
    pub fn vendor(&self, device: &DeviceSnapshot) -> Option<&'static str> {
        self.prefix(device).map(|p| p.vendor)
    }

    fn prefix(&self, device: &DeviceSnapshot) -> Option<&'static VendorPrefix> {
        let oui = device.mac.oui();
        VENDOR_PREFIXES.iter().find(|p| p.oui == oui)
    }

    /// Classify a device without looking at any kind it already carries.
    pub fn classify(&self, device: &DeviceSnapshot) -> DeviceKind {
        if let Some(kind) = self.prefix(device).and_then(|p| p.kind) {
            return kind;
        }

        if let Some(hostname) = device.hostname.as_deref() {
            if let Some((kind, _)) = self.hostname_rules.iter().find(|(_, re)| re.is_match(hostname)) {
                return *kind;
            }
        }

        for (kind, required) in SERVICE_PATTERNS {
            let all_present = required.iter().all(|(port, name)| {
                device
                    .services
                    .iter()
                    .any(|s| s.port == *port && s.service.to_ascii_lowercase().contains(name))
            });
            if all_present {
                return *kind;
            }
        }

        DeviceKind::Unknown
    }

    /// Fill vendor and kind where the worker left them empty.
    pub fn annotate(&self, device: &mut DeviceSnapshot) {
        if device.vendor.is_none() {
            device.vendor = self.vendor(device).map(str::to_string);
        }
        if device.kind == DeviceKind::Unknown {
            device.kind = self.classify(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::model::{MacAddress, ServiceEntry};

    fn device(mac: &str) -> DeviceSnapshot {
        DeviceSnapshot::new(MacAddress::parse(mac).unwrap(), "10.0.0.5".parse().unwrap())
    }

    #[test]
    fn vmware_prefix_is_virtual_machine() {
        let r = DeviceRecognizer::new();
        let d = device("00:50:56:aa:bb:cc");
        assert_eq!(r.vendor(&d), Some("VMware"));
        assert_eq!(r.classify(&d), DeviceKind::VirtualMachine);
    }

    #[test]
    fn hostname_rules_apply_in_order() {
        let r = DeviceRecognizer::new();
        assert_eq!(r.classify(&device("02:00:00:00:00:01").with_hostname("HP-Printer-3F")), DeviceKind::Printer);
        assert_eq!(r.classify(&device("02:00:00:00:00:02").with_hostname("core-gateway")), DeviceKind::Router);
        assert_eq!(r.classify(&device("02:00:00:00:00:03").with_hostname("ap-lobby")), DeviceKind::Router);
        assert_eq!(r.classify(&device("02:00:00:00:00:04").with_hostname("srv-db01")), DeviceKind::Server);
        assert_eq!(r.classify(&device("02:00:00:00:00:05").with_hostname("alice-laptop")), DeviceKind::Workstation);
    }

    #[test]
    fn service_set_must_be_complete() {
        let r = DeviceRecognizer::new();
        let partial = device("02:00:00:00:00:06")
            .with_service(ServiceEntry::new(80, "tcp", "http"))
            .with_service(ServiceEntry::new(443, "tcp", "https"));
        assert_eq!(r.classify(&partial), DeviceKind::Unknown);

        let full = partial.with_service(ServiceEntry::new(53, "udp", "domain"));
        assert_eq!(r.classify(&full), DeviceKind::Router);
    }

    #[test]
    fn annotate_keeps_worker_kind() {
        let r = DeviceRecognizer::new();
        let mut d = device("00:1a:a0:00:00:01").with_hostname("alice-laptop");
        d.kind = DeviceKind::Server;
        r.annotate(&mut d);
        assert_eq!(d.kind, DeviceKind::Server);
        assert_eq!(d.vendor.as_deref(), Some("Dell"));
    }
}
