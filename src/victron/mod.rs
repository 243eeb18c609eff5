/*
    Victron VRM specific naming: the site identifier, the broker sharding scheme
    and the topic namespace below N/, W/ and R/.
*/

use std::fmt;

pub mod topics;

/// Number of VRM broker shards, `mqtt0` up to `mqtt127`
pub const BROKER_SHARDS: u64 = 128;
pub const BROKER_DOMAIN: &str = "victronenergy.com";
pub const BROKER_PORT: u16 = 8883;

/// The portal id of an installation as entered by the user
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SiteIdentifier(String);

impl SiteIdentifier {
    pub fn new(id: &str) -> Self {
        return SiteIdentifier(id.trim().to_string());
    }

    pub fn as_str(&self) -> &str {
        return &self.0;
    }

    /// Lower-cased form used for the broker hash
    pub fn normalized(&self) -> String {
        return self.0.to_lowercase();
    }
}

impl fmt::Display for SiteIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Map a site identifier to the VRM broker serving it.
///
/// The broker is picked by summing the character codes of the trimmed,
/// lower-cased identifier modulo the shard count. Any deviation here ends
/// up at a broker that does not know the installation, so the formula must
/// stay byte for byte as VRM computes it.
pub fn resolve(site_identifier: &str) -> BrokerAddress {
    let normalized = site_identifier.trim().to_lowercase();
    let sum: u64 = normalized.chars().map(|c| c as u64).sum();

    return BrokerAddress {
        host: format!("mqtt{}.{}", sum % BROKER_SHARDS, BROKER_DOMAIN),
        port: BROKER_PORT,
    };
}
