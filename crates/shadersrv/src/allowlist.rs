//! IPv4 admission gate for the accept loop.
//!
//! Entries come from the `whitelist` config key as bare addresses
//! (`a.b.c.d`) or CIDR ranges (`a.b.c.d/N`). The host's own addresses are
//! added at startup so loopback and self-connections always get through.

use std::net::Ipv4Addr;

use tracing::warn;

#[derive(Clone, Copy, Debug)]
struct AllowEntry {
    /// Pre-masked address, host byte order.
    address: u32,
    mask: u32,
}

impl AllowEntry {
    fn matches(&self, ip: Ipv4Addr) -> bool {
        (u32::from(ip) & self.mask) == self.address
    }
}

#[derive(Debug, Default)]
pub struct AllowList {
    entries: Vec<AllowEntry>,
}

impl AllowList {
    /// Parses the configured patterns. Invalid entries are logged and
    /// skipped; a `/0` suffix is honored but warned about once, since it
    /// authorizes every address.
    pub fn parse(patterns: &[String]) -> Self {
        let mut entries = Vec::with_capacity(patterns.len() + 1);
        let mut warned_open = false;

        for pattern in patterns {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }
            match Self::parse_entry(pattern) {
                Some(entry) => {
                    if entry.mask == 0 && !warned_open {
                        warned_open = true;
                        warn!(
                            "allow-list contains a /0 entry; every IPv4 address is authorized. \
                             Use a narrower netmask unless this is intentional"
                        );
                    }
                    entries.push(entry);
                }
                None => warn!(pattern, "ignoring invalid allow-list entry"),
            }
        }

        AllowList { entries }
    }

    fn parse_entry(pattern: &str) -> Option<AllowEntry> {
        match pattern.rsplit_once('/') {
            Some((address, suffix)) => {
                let prefix: u32 = suffix.parse().ok()?;
                if prefix > 32 {
                    return None;
                }
                if prefix == 0 {
                    return Some(AllowEntry {
                        address: 0,
                        mask: 0,
                    });
                }
                let ip: Ipv4Addr = address.parse().ok()?;
                let mask = u32::MAX << (32 - prefix);
                Some(AllowEntry {
                    address: u32::from(ip) & mask,
                    mask,
                })
            }
            None => {
                let ip: Ipv4Addr = pattern.parse().ok()?;
                Some(AllowEntry {
                    address: u32::from(ip),
                    mask: u32::MAX,
                })
            }
        }
    }

    /// Admits loopback plus whatever the machine's own host name resolves
    /// to, so the server can always talk to itself (fallback peers on the
    /// same box, local tooling, the status page).
    pub async fn admit_local_host(&mut self) {
        self.entries.push(AllowEntry {
            address: u32::from(Ipv4Addr::LOCALHOST),
            mask: u32::MAX,
        });

        let host = match gethostname::gethostname().into_string() {
            Ok(host) => host,
            Err(raw) => {
                warn!(host = %raw.to_string_lossy(), "host name is not valid UTF-8; only loopback is self-admitted");
                return;
            }
        };
        let lookup_result = tokio::net::lookup_host((host.as_str(), 0u16)).await;
        match lookup_result {
            Ok(addresses) => {
                for addr in addresses {
                    if let std::net::SocketAddr::V4(v4) = addr {
                        self.entries.push(AllowEntry {
                            address: u32::from(*v4.ip()),
                            mask: u32::MAX,
                        });
                    }
                }
            }
            Err(error) => {
                warn!(host = %host, %error, "could not resolve own host name; only loopback is self-admitted");
            }
        }
    }

    pub fn permits(&self, ip: Ipv4Addr) -> bool {
        self.entries.iter().any(|entry| entry.matches(ip))
    }
}
