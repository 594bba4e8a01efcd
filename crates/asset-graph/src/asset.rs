use core::fmt;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use time::OffsetDateTime;

/// A typed, natural-keyed node of the asset graph.
///
/// The enum is closed on purpose: every component of the engine matches on it
/// exhaustively, and adding a variant is a deliberate, reviewed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Asset {
    Fqdn {
        name: SmolStr,
    },
    IpAddress {
        addr: IpAddr,
    },
    Netblock {
        cidr: IpNetwork,
    },
    Asn {
        number: u32,
    },
    DomainRecord {
        domain: SmolStr,
        name: Option<String>,
        registrar: Option<String>,
        #[serde(default, with = "time::serde::rfc3339::option")]
        expiration: Option<OffsetDateTime>,
        #[serde(default)]
        statuses: Vec<String>,
    },
    AutnumRecord {
        handle: SmolStr,
        name: Option<String>,
        status: Option<String>,
        #[serde(default, with = "time::serde::rfc3339::option")]
        updated: Option<OffsetDateTime>,
    },
    IpNetRecord {
        cidr: IpNetwork,
        name: Option<String>,
        status: Option<String>,
        #[serde(default, with = "time::serde::rfc3339::option")]
        updated: Option<OffsetDateTime>,
    },
    Person {
        full_name: String,
    },
    Organization {
        name: String,
    },
    Location {
        address: String,
    },
    PhoneNumber {
        number: SmolStr,
    },
    EmailAddress {
        address: SmolStr,
    },
    TlsCertificate {
        fingerprint: SmolStr,
        common_name: Option<String>,
    },
    Url {
        url: String,
    },
    Source {
        name: SmolStr,
        confidence: u8,
    },
}

/// Type tag of an [`Asset`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Fqdn,
    IpAddress,
    Netblock,
    Asn,
    DomainRecord,
    AutnumRecord,
    IpNetRecord,
    Person,
    Organization,
    Location,
    PhoneNumber,
    EmailAddress,
    TlsCertificate,
    Url,
    Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    V4,
    V6,
}

impl Asset {
    pub fn kind(&self) -> AssetKind {
        match self {
            Asset::Fqdn { .. } => AssetKind::Fqdn,
            Asset::IpAddress { .. } => AssetKind::IpAddress,
            Asset::Netblock { .. } => AssetKind::Netblock,
            Asset::Asn { .. } => AssetKind::Asn,
            Asset::DomainRecord { .. } => AssetKind::DomainRecord,
            Asset::AutnumRecord { .. } => AssetKind::AutnumRecord,
            Asset::IpNetRecord { .. } => AssetKind::IpNetRecord,
            Asset::Person { .. } => AssetKind::Person,
            Asset::Organization { .. } => AssetKind::Organization,
            Asset::Location { .. } => AssetKind::Location,
            Asset::PhoneNumber { .. } => AssetKind::PhoneNumber,
            Asset::EmailAddress { .. } => AssetKind::EmailAddress,
            Asset::TlsCertificate { .. } => AssetKind::TlsCertificate,
            Asset::Url { .. } => AssetKind::Url,
            Asset::Source { .. } => AssetKind::Source,
        }
    }

    /// Canonical natural key.
    ///
    /// Two live assets of the same kind with an equal key must resolve to the
    /// same id; every store implementation upserts on `(kind, key)`.
    pub fn key(&self) -> String {
        match self {
            Asset::Fqdn { name } => name.to_lowercase(),
            Asset::IpAddress { addr } => addr.to_string(),
            Asset::Netblock { cidr } => cidr.to_string(),
            Asset::Asn { number } => format!("AS{number}"),
            Asset::DomainRecord { domain, .. } => domain.to_lowercase(),
            Asset::AutnumRecord { handle, .. } => handle.to_string(),
            Asset::IpNetRecord { cidr, .. } => cidr.to_string(),
            Asset::Person { full_name } => full_name.clone(),
            Asset::Organization { name } => name.clone(),
            Asset::Location { address } => address.clone(),
            Asset::PhoneNumber { number } => number.to_string(),
            Asset::EmailAddress { address } => address.to_lowercase(),
            Asset::TlsCertificate { fingerprint, .. } => fingerprint.to_lowercase(),
            Asset::Url { url } => url.clone(),
            Asset::Source { name, .. } => name.to_string(),
        }
    }

    pub fn fqdn(name: impl Into<SmolStr>) -> Self {
        Asset::Fqdn { name: name.into() }
    }

    pub fn ip(addr: IpAddr) -> Self {
        Asset::IpAddress { addr }
    }

    pub fn family(&self) -> Option<IpFamily> {
        match self {
            Asset::IpAddress { addr: IpAddr::V4(_) } => Some(IpFamily::V4),
            Asset::IpAddress { addr: IpAddr::V6(_) } => Some(IpFamily::V6),
            _ => None,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssetKind::Fqdn => "fqdn",
            AssetKind::IpAddress => "ip_address",
            AssetKind::Netblock => "netblock",
            AssetKind::Asn => "asn",
            AssetKind::DomainRecord => "domain_record",
            AssetKind::AutnumRecord => "autnum_record",
            AssetKind::IpNetRecord => "ipnet_record",
            AssetKind::Person => "person",
            AssetKind::Organization => "organization",
            AssetKind::Location => "location",
            AssetKind::PhoneNumber => "phone_number",
            AssetKind::EmailAddress => "email_address",
            AssetKind::TlsCertificate => "tls_certificate",
            AssetKind::Url => "url",
            AssetKind::Source => "source",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Asset::fqdn("WWW.Example.COM"), "www.example.com")]
    #[case(Asset::ip("192.0.2.7".parse().unwrap()), "192.0.2.7")]
    #[case(Asset::Asn { number: 64500 }, "AS64500")]
    #[case(Asset::EmailAddress { address: "Admin@Example.com".into() }, "admin@example.com")]
    #[case(Asset::Netblock { cidr: "192.0.2.0/24".parse().unwrap() }, "192.0.2.0/24")]
    fn natural_keys_are_canonical(#[case] asset: Asset, #[case] expected: &str) {
        assert_eq!(asset.key(), expected);
    }

    #[test]
    fn same_fact_same_key_regardless_of_case() {
        let a = Asset::fqdn("api.EXAMPLE.com");
        let b = Asset::fqdn("API.example.COM");
        assert_eq!(a.key(), b.key());
        assert_eq!(a.kind(), b.kind());
    }

    #[test]
    fn family_is_derived_from_the_address() {
        let v4 = Asset::ip("198.51.100.1".parse().unwrap());
        let v6 = Asset::ip("2001:db8::1".parse().unwrap());
        assert_eq!(v4.family(), Some(IpFamily::V4));
        assert_eq!(v6.family(), Some(IpFamily::V6));
        assert_eq!(Asset::Asn { number: 1 }.family(), None);
    }

    #[test]
    fn serde_round_trip_keeps_the_kind_tag() {
        let asset = Asset::Source {
            name: "rdap".into(),
            confidence: 50,
        };
        let json = serde_json::to_string(&asset).unwrap();
        assert!(json.contains(r#""kind":"source""#));
        let back: Asset = serde_json::from_str(&json).unwrap();
        assert_eq!(back, asset);
    }
}
