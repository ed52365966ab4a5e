//! Network profile detection: DNS, reachability and VPN tunnels.

use std::net::ToSocketAddrs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkProfile {
    Online,
    Vpn,
    Offline,
    /// Not probed (sync disabled and no rule needed it).
    Unknown,
}

impl NetworkProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Vpn => "VPN",
            Self::Offline => "OFFLINE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for NetworkProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network probe abstraction (allows mocking for tests).
pub trait NetworkProbe: Send + Sync {
    /// The remote API host resolves.
    fn resolves(&self) -> bool;

    /// The remote API answers with any HTTP response.
    fn reachable(&self) -> bool;

    fn vpn_active(&self) -> bool;

    fn profile(&self) -> NetworkProfile {
        if !self.resolves() || !self.reachable() {
            NetworkProfile::Offline
        } else if self.vpn_active() {
            NetworkProfile::Vpn
        } else {
            NetworkProfile::Online
        }
    }
}

/// Interface name prefixes treated as VPN tunnels.
const TUNNEL_PREFIXES: &[&str] = &["tun", "tap", "wg", "utun", "ppp", "ipsec", "tailscale"];

pub struct SystemNetworkProbe {
    url: String,
    host: Option<(String, u16)>,
    timeout: Duration,
}

impl SystemNetworkProbe {
    pub fn new(api_base: &str, timeout: Duration) -> Self {
        let host = reqwest::Url::parse(api_base).ok().and_then(|u| {
            let host = u.host_str()?.to_string();
            let port = u.port_or_known_default()?;
            Some((host, port))
        });
        Self {
            url: api_base.to_string(),
            host,
            timeout,
        }
    }
}

impl NetworkProbe for SystemNetworkProbe {
    fn resolves(&self) -> bool {
        let Some((host, port)) = &self.host else {
            return false;
        };
        match (host.as_str(), *port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                tracing::debug!(host = %host, error = %e, "DNS resolution failed");
                false
            }
        }
    }

    fn reachable(&self) -> bool {
        let client = match reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
        {
            Ok(c) => c,
            Err(_) => return false,
        };
        match client.head(&self.url).send() {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Reachability probe failed");
                false
            }
        }
    }

    fn vpn_active(&self) -> bool {
        let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
            return false;
        };
        entries.flatten().any(|e| {
            let name = e.file_name().to_string_lossy().to_lowercase();
            TUNNEL_PREFIXES.iter().any(|p| name.starts_with(p))
        })
    }
}

/// Fixed answers for tests.
#[derive(Debug, Clone, Copy)]
pub struct MockNetworkProbe {
    pub resolves: bool,
    pub reachable: bool,
    pub vpn: bool,
}

impl MockNetworkProbe {
    pub fn online() -> Self {
        Self {
            resolves: true,
            reachable: true,
            vpn: false,
        }
    }

    pub fn offline() -> Self {
        Self {
            resolves: false,
            reachable: false,
            vpn: false,
        }
    }

    pub fn vpn() -> Self {
        Self {
            vpn: true,
            ..Self::online()
        }
    }
}

impl NetworkProbe for MockNetworkProbe {
    fn resolves(&self) -> bool {
        self.resolves
    }

    fn reachable(&self) -> bool {
        self.reachable
    }

    fn vpn_active(&self) -> bool {
        self.vpn
    }
}
