//! Predicates selecting which network identities a query covers

use std::{fmt, str::FromStr};

use crate::identity::{IdentitySet, NetworkIdentity, NetworkType};

/// Errors produced when parsing a [`NetworkTemplate`]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The rule name was not recognised
    #[error("unknown template rule: {0}")]
    UnknownRule(String),
}

/// A predicate over [`NetworkIdentity`] values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetworkTemplate {
    /// Cellular traffic for one subscriber
    Mobile {
        /// Subscriber to match
        subscriber_id: String,
    },
    /// Cellular traffic for any subscriber
    MobileWildcard,
    /// Wi-Fi traffic, optionally restricted to one network id
    Wifi {
        /// Network id to match, `None` for any
        network_id: Option<String>,
    },
    /// Wi-Fi traffic for any network
    WifiWildcard,
    /// Wired ethernet
    Ethernet,
    /// Bluetooth tethering
    Bluetooth,
    /// Proxy networks
    Proxy,
    /// Every identity
    All,
}

impl NetworkTemplate {
    /// The fixed set of templates used to group compact checkin output,
    /// with their line prefixes.
    #[must_use]
    pub fn checkin_groups() -> [(Self, &'static str); 4] {
        [
            (Self::MobileWildcard, "cell"),
            (Self::WifiWildcard, "wifi"),
            (Self::Ethernet, "eth"),
            (Self::Bluetooth, "bt"),
        ]
    }

    /// Test a single identity
    #[must_use]
    pub fn matches(&self, ident: &NetworkIdentity) -> bool {
        match self {
            Self::Mobile { subscriber_id } => {
                ident.network_type.is_mobile()
                    && ident.subscriber_id.as_deref() == Some(subscriber_id.as_str())
            }
            Self::MobileWildcard => ident.network_type.is_mobile(),
            Self::Wifi { network_id } => {
                ident.network_type == NetworkType::Wifi
                    && network_id
                        .as_deref()
                        .is_none_or(|id| ident.network_id.as_deref() == Some(id))
            }
            Self::WifiWildcard => ident.network_type == NetworkType::Wifi,
            Self::Ethernet => ident.network_type == NetworkType::Ethernet,
            Self::Bluetooth => ident.network_type == NetworkType::Bluetooth,
            Self::Proxy => ident.network_type == NetworkType::Proxy,
            Self::All => true,
        }
    }

    /// A template matches a set when it matches any member of it.
    #[must_use]
    pub fn matches_set(&self, set: &IdentitySet) -> bool {
        set.iter().any(|ident| self.matches(ident))
    }
}

impl fmt::Display for NetworkTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mobile { subscriber_id } => write!(f, "mobile:{subscriber_id}"),
            Self::MobileWildcard => write!(f, "mobile"),
            Self::Wifi {
                network_id: Some(id),
            } => write!(f, "wifi:{id}"),
            Self::Wifi { network_id: None } | Self::WifiWildcard => write!(f, "wifi"),
            Self::Ethernet => write!(f, "ethernet"),
            Self::Bluetooth => write!(f, "bluetooth"),
            Self::Proxy => write!(f, "proxy"),
            Self::All => write!(f, "all"),
        }
    }
}

impl FromStr for NetworkTemplate {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (rule, arg) = match input.split_once(':') {
            Some((rule, arg)) => (rule, Some(arg)),
            None => (input, None),
        };
        match (rule.trim().to_ascii_lowercase().as_str(), arg) {
            ("mobile" | "cell", Some(id)) => Ok(Self::Mobile {
                subscriber_id: id.to_string(),
            }),
            ("mobile" | "cell", None) => Ok(Self::MobileWildcard),
            ("wifi", Some(id)) => Ok(Self::Wifi {
                network_id: Some(id.to_string()),
            }),
            ("wifi", None) => Ok(Self::WifiWildcard),
            ("ethernet" | "eth", None) => Ok(Self::Ethernet),
            ("bluetooth" | "bt", None) => Ok(Self::Bluetooth),
            ("proxy", None) => Ok(Self::Proxy),
            ("all", None) => Ok(Self::All),
            _ => Err(Error::UnknownRule(input.to_string())),
        }
    }
}
