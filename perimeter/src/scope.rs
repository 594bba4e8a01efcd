//! Session scope: decides which candidate assets belong to the footprint
//! being mapped, with a confidence score in [0, 100].
//!
//! The rules here are the pure part (seeds and keyword lists only). Verdicts
//! that need the graph (addresses announced by a seed ASN, ancillary assets
//! reached through registration edges) live on [`crate::session::Session`].

use asset_graph::Asset;
use ipnetwork::IpNetwork;
use smol_str::SmolStr;
use typed_builder::TypedBuilder;

pub const CONFIDENCE_SEED: u8 = 100;
pub const CONFIDENCE_SUBDOMAIN: u8 = 90;
pub const CONFIDENCE_OVERLAP: u8 = 90;
pub const CONFIDENCE_ANNOUNCED: u8 = 80;

/// Scope verdict: the canonical form of the candidate plus its confidence.
/// Confidence 0 means rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub asset: Asset,
    pub confidence: u8,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct Scope {
    /// Seed domains, already normalized to canonical FQDN form.
    #[builder(default)]
    domains: Vec<SmolStr>,
    #[builder(default)]
    cidrs: Vec<IpNetwork>,
    #[builder(default)]
    asns: Vec<u32>,
    /// When non-empty, an FQDN must contain one of these to be accepted
    /// (seeds and their subdomains always pass).
    #[builder(default)]
    allow: Vec<String>,
    /// An FQDN containing any of these is always rejected.
    #[builder(default)]
    deny: Vec<String>,
    #[builder(default = 4)]
    max_depth: u32,
}

impl Scope {
    pub fn seed_domains(&self) -> &[SmolStr] {
        &self.domains
    }

    pub fn seed_cidrs(&self) -> &[IpNetwork] {
        &self.cidrs
    }

    pub fn seed_asns(&self) -> &[u32] {
        &self.asns
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Confidence of the candidate based on seeds alone; 0 rejects.
    ///
    /// When several rules match, the highest confidence wins.
    pub fn assess(&self, asset: &Asset) -> u8 {
        match asset {
            Asset::Fqdn { name } => self.domain_confidence(name),
            Asset::IpAddress { addr } => {
                let inside = self.cidrs.iter().any(|cidr| cidr.contains(*addr));
                if inside {
                    CONFIDENCE_SEED
                } else {
                    0
                }
            }
            Asset::Netblock { cidr } => self.netblock_confidence(*cidr),
            Asset::Asn { number } => {
                if self.asns.contains(number) {
                    CONFIDENCE_SEED
                } else {
                    0
                }
            }
            // Everything else requires graph context.
            _ => 0,
        }
    }

    pub fn is_seed_domain(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.domains.iter().any(|seed| seed.as_str() == name)
    }

    fn domain_confidence(&self, name: &str) -> u8 {
        let name = name.to_ascii_lowercase();

        if self.deny.iter().any(|word| name.contains(word.as_str())) {
            return 0;
        }

        let best = self
            .domains
            .iter()
            .filter_map(|seed| domain_match(&name, seed))
            .max()
            .unwrap_or(0);

        // The allow list narrows discovered names, never the seeds themselves.
        if best == CONFIDENCE_SUBDOMAIN
            && !self.allow.is_empty()
            && !self.allow.iter().any(|word| name.contains(word.as_str()))
        {
            return 0;
        }

        best
    }

    fn netblock_confidence(&self, cidr: IpNetwork) -> u8 {
        self.cidrs
            .iter()
            .filter_map(|seed| {
                if *seed == cidr {
                    Some(CONFIDENCE_SEED)
                } else if overlaps(*seed, cidr) {
                    Some(CONFIDENCE_OVERLAP)
                } else {
                    None
                }
            })
            .max()
            .unwrap_or(0)
    }
}

/// Label-wise suffix match on dot-aligned boundaries, case already folded.
fn domain_match(name: &str, seed: &str) -> Option<u8> {
    if name == seed {
        return Some(CONFIDENCE_SEED);
    }

    name.strip_suffix(seed)
        .filter(|prefix| prefix.ends_with('.') && prefix.len() > 1)
        .map(|_| CONFIDENCE_SUBDOMAIN)
}

fn overlaps(a: IpNetwork, b: IpNetwork) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn scope() -> Scope {
        Scope::builder()
            .domains(vec!["example.com".into(), "example.net".into()])
            .cidrs(vec!["192.0.2.0/24".parse().unwrap()])
            .asns(vec![64500])
            .build()
    }

    #[rstest]
    #[case("example.com", CONFIDENCE_SEED)]
    #[case("EXAMPLE.COM", CONFIDENCE_SEED)]
    #[case("www.example.com", CONFIDENCE_SUBDOMAIN)]
    #[case("deep.api.example.net", CONFIDENCE_SUBDOMAIN)]
    #[case("notexample.com", 0)]
    #[case("example.com.evil.org", 0)]
    #[case("unrelated.org", 0)]
    fn fqdn_scoping(#[case] name: &str, #[case] expected: u8) {
        assert_eq!(scope().assess(&Asset::fqdn(name)), expected);
    }

    #[rstest]
    #[case("192.0.2.55", CONFIDENCE_SEED)]
    #[case("198.51.100.1", 0)]
    fn address_scoping(#[case] addr: &str, #[case] expected: u8) {
        assert_eq!(scope().assess(&Asset::ip(addr.parse().unwrap())), expected);
    }

    #[rstest]
    #[case("192.0.2.0/24", CONFIDENCE_SEED)]
    #[case("192.0.2.128/25", CONFIDENCE_OVERLAP)]
    #[case("192.0.0.0/16", CONFIDENCE_OVERLAP)]
    #[case("203.0.113.0/24", 0)]
    fn netblock_scoping(#[case] cidr: &str, #[case] expected: u8) {
        assert_eq!(
            scope().assess(&Asset::Netblock {
                cidr: cidr.parse().unwrap()
            }),
            expected
        );
    }

    #[test]
    fn asn_scoping() {
        assert_eq!(scope().assess(&Asset::Asn { number: 64500 }), CONFIDENCE_SEED);
        assert_eq!(scope().assess(&Asset::Asn { number: 64501 }), 0);
    }

    #[test]
    fn deny_list_rejects_even_subdomains_of_seeds() {
        let scope = Scope::builder()
            .domains(vec!["example.com".into()])
            .deny(vec!["internal".to_owned()])
            .build();

        assert_eq!(scope.assess(&Asset::fqdn("internal.example.com")), 0);
        assert_eq!(scope.assess(&Asset::fqdn("www.example.com")), CONFIDENCE_SUBDOMAIN);
    }

    #[test]
    fn allow_list_narrows_discovered_names_only() {
        let scope = Scope::builder()
            .domains(vec!["example.com".into()])
            .allow(vec!["api".to_owned()])
            .build();

        assert_eq!(scope.assess(&Asset::fqdn("api.example.com")), CONFIDENCE_SUBDOMAIN);
        assert_eq!(scope.assess(&Asset::fqdn("www.example.com")), 0);
        // The seed itself is never filtered out.
        assert_eq!(scope.assess(&Asset::fqdn("example.com")), CONFIDENCE_SEED);
    }

    #[test]
    fn ancillary_assets_need_graph_context() {
        let person = Asset::Person {
            full_name: "Jane Doe".to_owned(),
        };
        assert_eq!(scope().assess(&person), 0);
    }
}
