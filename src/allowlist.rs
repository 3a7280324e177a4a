use anyhow::{Context, Result};
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::debug;

/// Source-address filter applied at the listener, before route evaluation.
///
/// The CIDR list is fixed at construction and shared by every route. An empty
/// list permits nothing; a `0.0.0.0/0` entry permits everything.
#[derive(Debug, Clone)]
pub struct AllowList {
    networks: Vec<IpNet>,
}

impl AllowList {
    pub fn new(cidrs: &[String]) -> Result<Self> {
        let networks = cidrs
            .iter()
            .map(|cidr| {
                cidr.parse::<IpNet>()
                    .with_context(|| format!("Invalid CIDR range: {}", cidr))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { networks })
    }

    /// Returns true when the source address falls inside any configured range.
    pub fn permits(&self, addr: IpAddr) -> bool {
        let allowed = self.networks.iter().any(|net| net.contains(&addr));
        if !allowed {
            debug!("Source {} matched no allowed CIDR range", addr);
        }
        allowed
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}
