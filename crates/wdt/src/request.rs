use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What to transfer and where.
///
/// On the receiver `directory` is the destination and `ports` is filled in by
/// `Receiver::init()`. On the sender `directory` is the source tree and
/// `ports` (when set) lists the receiver ports to dial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Names the logical transfer. Empty on a receiver means any sender is
    /// accepted.
    #[serde(default)]
    pub identity: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub start_port: u16,
    pub num_ports: u16,
    pub directory: PathBuf,
    #[serde(default)]
    pub ports: Vec<u16>,
}

fn default_host() -> String {
    "localhost".to_string()
}

impl TransferRequest {
    pub fn new(start_port: u16, num_ports: u16, directory: impl Into<PathBuf>) -> Self {
        TransferRequest {
            identity: String::new(),
            host: default_host(),
            start_port,
            num_ports,
            directory: directory.into(),
            ports: Vec::new(),
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    /// Ports a sender dials: the resolved list when present, otherwise the
    /// consecutive range from `start_port`.
    pub fn dial_ports(&self) -> Vec<u16> {
        if !self.ports.is_empty() {
            return self.ports.clone();
        }
        if self.start_port == 0 {
            return Vec::new();
        }
        (0..self.num_ports)
            .filter_map(|i| self.start_port.checked_add(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_ports_prefers_resolved_list() {
        let req = TransferRequest::new(22356, 3, "/tmp/x");
        assert_eq!(req.dial_ports(), vec![22356, 22357, 22358]);
        let req = req.with_ports(vec![40000, 40007]);
        assert_eq!(req.dial_ports(), vec![40000, 40007]);
        assert!(TransferRequest::new(0, 4, "/tmp/x").dial_ports().is_empty());
    }

    #[test]
    fn deserializes_with_defaults() {
        let req: TransferRequest =
            serde_json::from_str(r#"{"start_port":1,"num_ports":2,"directory":"/d"}"#).unwrap();
        assert_eq!(req.host, "localhost");
        assert!(req.identity.is_empty());
        assert!(req.ports.is_empty());
    }
}
