//! Network identities and the sets of them active on an interface
//!
//! A [`NetworkIdentity`] describes one network a device was attached to when a
//! byte was counted: its class, subtype, the carrier subscriber or Wi-Fi
//! network id and the roaming and metering state. More than one network can
//! be active on a single interface at once, so samples are attributed to an
//! [`IdentitySet`]. Sets compare by content and are immutable once built; in
//! aggregation keys they are shared through `Arc`.

use std::{collections::BTreeSet, fmt, sync::Arc};

use bytes::BufMut;

use crate::codec::{self, Reader};

const VERSION_INIT: i32 = 1;
const VERSION_ADD_ROAMING: i32 = 2;
const VERSION_ADD_NETWORK_ID: i32 = 3;
const VERSION_ADD_METERED: i32 = 4;

/// Errors produced when decoding an [`IdentitySet`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Underlying primitive decode failed
    #[error(transparent)]
    Codec(#[from] codec::Error),
    /// Identity set header carried a version this crate does not know
    #[error("unknown identity set version: {version}")]
    UnknownVersion {
        /// The version found
        version: i32,
    },
}

/// Class of network, with the integer codes used on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NetworkType {
    /// Default cellular data
    Mobile,
    /// Wi-Fi
    Wifi,
    /// Cellular MMS APN
    MobileMms,
    /// Cellular SUPL APN
    MobileSupl,
    /// Cellular dial-up networking APN
    MobileDun,
    /// Cellular high-priority APN
    MobileHipri,
    /// WiMAX
    Wimax,
    /// Bluetooth PAN
    Bluetooth,
    /// Placeholder network
    Dummy,
    /// Wired ethernet
    Ethernet,
    /// Proxy network
    Proxy,
    /// Virtual private network
    Vpn,
    /// A code this crate has no name for, preserved verbatim
    Other(i32),
}

impl NetworkType {
    /// The on-disk integer code for this type
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Mobile => 0,
            Self::Wifi => 1,
            Self::MobileMms => 2,
            Self::MobileSupl => 3,
            Self::MobileDun => 4,
            Self::MobileHipri => 5,
            Self::Wimax => 6,
            Self::Bluetooth => 7,
            Self::Dummy => 8,
            Self::Ethernet => 9,
            Self::Proxy => 16,
            Self::Vpn => 17,
            Self::Other(code) => code,
        }
    }

    /// Decode an on-disk integer code
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Mobile,
            1 => Self::Wifi,
            2 => Self::MobileMms,
            3 => Self::MobileSupl,
            4 => Self::MobileDun,
            5 => Self::MobileHipri,
            6 => Self::Wimax,
            7 => Self::Bluetooth,
            8 => Self::Dummy,
            9 => Self::Ethernet,
            16 => Self::Proxy,
            17 => Self::Vpn,
            other => Self::Other(other),
        }
    }

    /// True for every cellular flavour, including WiMAX
    #[must_use]
    pub fn is_mobile(self) -> bool {
        matches!(
            self,
            Self::Mobile
                | Self::MobileMms
                | Self::MobileSupl
                | Self::MobileDun
                | Self::MobileHipri
                | Self::Wimax
        )
    }

    fn name(self) -> String {
        match self {
            Self::Mobile => "MOBILE".into(),
            Self::Wifi => "WIFI".into(),
            Self::MobileMms => "MOBILE_MMS".into(),
            Self::MobileSupl => "MOBILE_SUPL".into(),
            Self::MobileDun => "MOBILE_DUN".into(),
            Self::MobileHipri => "MOBILE_HIPRI".into(),
            Self::Wimax => "WIMAX".into(),
            Self::Bluetooth => "BLUETOOTH".into(),
            Self::Dummy => "DUMMY".into(),
            Self::Ethernet => "ETHERNET".into(),
            Self::Proxy => "PROXY".into(),
            Self::Vpn => "VPN".into(),
            Self::Other(code) => format!("TYPE_{code}"),
        }
    }
}

/// One elementary network identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkIdentity {
    /// Class of network
    pub network_type: NetworkType,
    /// Radio technology or similar sub-classification, `-1` when unknown
    pub subtype: i32,
    /// Carrier subscriber identifier for cellular networks
    pub subscriber_id: Option<String>,
    /// Network identifier, for Wi-Fi the SSID
    pub network_id: Option<String>,
    /// Whether the device was roaming
    pub roaming: bool,
    /// Whether the network was metered
    pub metered: bool,
}

impl NetworkIdentity {
    /// Construct an identity with no subscriber or network id
    #[must_use]
    pub fn new(network_type: NetworkType) -> Self {
        Self {
            network_type,
            subtype: -1,
            subscriber_id: None,
            network_id: None,
            roaming: false,
            metered: network_type.is_mobile(),
        }
    }

    /// Set the subscriber identifier
    #[must_use]
    pub fn with_subscriber_id(mut self, subscriber_id: impl Into<String>) -> Self {
        self.subscriber_id = Some(subscriber_id.into());
        self
    }

    /// Set the network identifier
    #[must_use]
    pub fn with_network_id(mut self, network_id: impl Into<String>) -> Self {
        self.network_id = Some(network_id.into());
        self
    }

    /// Set the roaming flag
    #[must_use]
    pub fn with_roaming(mut self, roaming: bool) -> Self {
        self.roaming = roaming;
        self
    }

    /// Set the metered flag
    #[must_use]
    pub fn with_metered(mut self, metered: bool) -> Self {
        self.metered = metered;
        self
    }
}

impl fmt::Display for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{type={}", self.network_type.name())?;
        if self.subtype >= 0 {
            write!(f, ", subType={}", self.subtype)?;
        }
        if let Some(subscriber) = &self.subscriber_id {
            write!(f, ", subscriberId={}", scrub_subscriber(subscriber))?;
        }
        if let Some(network) = &self.network_id {
            write!(f, ", networkId={network}")?;
        }
        if self.roaming {
            write!(f, ", ROAMING")?;
        }
        write!(f, ", metered={}}}", self.metered)
    }
}

/// Only the leading digits of a subscriber id are printed in dumps.
fn scrub_subscriber(subscriber: &str) -> String {
    let shown: String = subscriber.chars().take(6).collect();
    if shown.len() < subscriber.len() {
        format!("{shown}...")
    } else {
        shown
    }
}

/// An unordered set of [`NetworkIdentity`] values.
///
/// Members are held in a `BTreeSet` so equality and hashing are by content
/// and iteration order is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentitySet {
    members: BTreeSet<NetworkIdentity>,
}

impl IdentitySet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity to the set, returning false if it was already present
    pub fn insert(&mut self, identity: NetworkIdentity) -> bool {
        self.members.insert(identity)
    }

    /// Membership test
    #[must_use]
    pub fn contains(&self, identity: &NetworkIdentity) -> bool {
        self.members.contains(identity)
    }

    /// Iterate members in deterministic order
    pub fn iter(&self) -> impl Iterator<Item = &NetworkIdentity> {
        self.members.iter()
    }

    /// Number of members
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True when the set has no members
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Freeze this set for sharing between aggregation keys
    #[must_use]
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Append the binary form of this set to `out`
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.put_i32(VERSION_ADD_METERED);
        codec::put_count(out, self.members.len());
        for ident in &self.members {
            out.put_i32(ident.network_type.code());
            out.put_i32(ident.subtype);
            codec::put_optional_string(out, ident.subscriber_id.as_deref());
            codec::put_optional_string(out, ident.network_id.as_deref());
            codec::put_bool(out, ident.roaming);
            codec::put_bool(out, ident.metered);
        }
    }

    /// Decode a set previously written by [`IdentitySet::write_to`], or by
    /// any older layout version.
    ///
    /// # Errors
    ///
    /// Fails if the input is truncated or carries an unknown version.
    pub fn read_from(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let version = reader.i32("identity set version")?;
        if !(VERSION_INIT..=VERSION_ADD_METERED).contains(&version) {
            return Err(Error::UnknownVersion { version });
        }
        let size = reader.count("identity set size")?;
        let mut set = Self::new();
        for _ in 0..size {
            // the first layout wrote a per-member version we can skip
            if version <= VERSION_INIT {
                reader.i32("identity member version")?;
            }
            let network_type = NetworkType::from_code(reader.i32("network type")?);
            let subtype = reader.i32("network subtype")?;
            let subscriber_id = reader.optional_string("subscriber id")?;
            let network_id = if version >= VERSION_ADD_NETWORK_ID {
                reader.optional_string("network id")?
            } else {
                None
            };
            let roaming = if version >= VERSION_ADD_ROAMING {
                reader.bool("roaming")?
            } else {
                false
            };
            let metered = if version >= VERSION_ADD_METERED {
                reader.bool("metered")?
            } else {
                network_type == NetworkType::Mobile
            };
            set.insert(NetworkIdentity {
                network_type,
                subtype,
                subscriber_id,
                network_id,
                roaming,
                metered,
            });
        }
        Ok(set)
    }
}

impl FromIterator<NetworkIdentity> for IdentitySet {
    fn from_iter<I: IntoIterator<Item = NetworkIdentity>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a IdentitySet {
    type Item = &'a NetworkIdentity;
    type IntoIter = std::collections::btree_set::Iter<'a, NetworkIdentity>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}

impl fmt::Display for IdentitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, ident) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{ident}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    pub(crate) fn wifi(ssid: &str) -> Arc<IdentitySet> {
        std::iter::once(NetworkIdentity::new(NetworkType::Wifi).with_network_id(ssid))
            .collect::<IdentitySet>()
            .into_shared()
    }

    pub(crate) fn mobile(subscriber: &str) -> Arc<IdentitySet> {
        std::iter::once(NetworkIdentity::new(NetworkType::Mobile).with_subscriber_id(subscriber))
            .collect::<IdentitySet>()
            .into_shared()
    }

    fn identity_strategy() -> impl Strategy<Value = NetworkIdentity> {
        (
            prop_oneof![
                Just(NetworkType::Mobile),
                Just(NetworkType::Wifi),
                Just(NetworkType::Ethernet),
                Just(NetworkType::Bluetooth),
                (20..100i32).prop_map(NetworkType::Other),
            ],
            -1..20i32,
            proptest::option::of("[0-9]{1,15}"),
            proptest::option::of("[a-zA-Z0-9 ]{0,32}"),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(
                |(network_type, subtype, subscriber_id, network_id, roaming, metered)| {
                    NetworkIdentity {
                        network_type,
                        subtype,
                        subscriber_id,
                        network_id,
                        roaming,
                        metered,
                    }
                },
            )
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let a = NetworkIdentity::new(NetworkType::Wifi).with_network_id("home");
        let b = NetworkIdentity::new(NetworkType::Mobile).with_subscriber_id("310260");

        let mut first = IdentitySet::new();
        first.insert(a.clone());
        first.insert(b.clone());
        let mut second = IdentitySet::new();
        second.insert(b);
        second.insert(a.clone());
        assert!(!second.insert(a));

        assert_eq!(first, second);
    }

    #[test]
    fn unknown_version_fails() {
        let mut out = Vec::new();
        out.put_i32(99);
        out.put_i32(0);
        let err = IdentitySet::read_from(&mut Reader::new(&out)).unwrap_err();
        assert_eq!(err, Error::UnknownVersion { version: 99 });
    }

    #[test]
    fn truncated_member_fails() {
        let set = wifi("home");
        let mut out = Vec::new();
        set.write_to(&mut out);
        out.truncate(out.len() - 1);
        assert!(matches!(
            IdentitySet::read_from(&mut Reader::new(&out)),
            Err(Error::Codec(codec::Error::Truncated { .. }))
        ));
    }

    #[test]
    fn version_one_members_default_missing_fields() {
        let mut out = Vec::new();
        out.put_i32(VERSION_INIT);
        out.put_i32(1);
        out.put_i32(VERSION_INIT);
        out.put_i32(NetworkType::Mobile.code());
        out.put_i32(3);
        codec::put_optional_string(&mut out, Some("310260"));
        let set = IdentitySet::read_from(&mut Reader::new(&out)).unwrap();
        let ident = set.iter().next().unwrap();
        assert_eq!(ident.subtype, 3);
        assert!(!ident.roaming);
        assert!(ident.metered);
        assert_eq!(ident.network_id, None);
    }

    proptest! {
        #[test]
        fn binary_form_preserves_membership(members in proptest::collection::vec(identity_strategy(), 0..6)) {
            let set: IdentitySet = members.into_iter().collect();
            let mut out = Vec::new();
            set.write_to(&mut out);
            let mut reader = Reader::new(&out);
            let decoded = IdentitySet::read_from(&mut reader).unwrap();
            prop_assert_eq!(reader.remaining(), 0);
            prop_assert_eq!(decoded, set);
        }
    }
}
