use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::store::{AssetId, RelationId};

/// Directed, labeled edge of the asset graph.
///
/// Relations are append-only: re-observing an existing `(from, to, label)`
/// refreshes `last_seen` instead of inserting a second edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: RelationId,
    pub from_id: AssetId,
    pub to_id: AssetId,
    pub label: RelationLabel,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationLabel {
    Registration,
    Registrant,
    RegistrantContact,
    AssociatedWith,
    ResolvesTo,
    SubdomainOf,
    Contains,
    Announces,
    Person,
    Organization,
    Location,
    Phone,
    Email,
    Source,
}

impl RelationLabel {
    pub const fn as_str(self) -> &'static str {
        match self {
            RelationLabel::Registration => "registration",
            RelationLabel::Registrant => "registrant",
            RelationLabel::RegistrantContact => "registrant_contact",
            RelationLabel::AssociatedWith => "associated_with",
            RelationLabel::ResolvesTo => "resolves_to",
            RelationLabel::SubdomainOf => "subdomain_of",
            RelationLabel::Contains => "contains",
            RelationLabel::Announces => "announces",
            RelationLabel::Person => "person",
            RelationLabel::Organization => "organization",
            RelationLabel::Location => "location",
            RelationLabel::Phone => "phone",
            RelationLabel::Email => "email",
            RelationLabel::Source => "source",
        }
    }

    /// True for labels stored symmetrically (one edge in each direction), so
    /// that traversal does not depend on which side was ingested first.
    pub const fn is_symmetric(self) -> bool {
        matches!(self, RelationLabel::AssociatedWith)
    }

    /// Contact-detail labels expanded by verbose association output.
    pub const CONTACT_LABELS: [RelationLabel; 5] = [
        RelationLabel::Person,
        RelationLabel::Organization,
        RelationLabel::Location,
        RelationLabel::Phone,
        RelationLabel::Email,
    ];
}

#[derive(Debug, thiserror::Error)]
#[error("unknown relation label: {0}")]
pub struct UnknownLabel(String);

impl FromStr for RelationLabel {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = match s {
            "registration" => RelationLabel::Registration,
            "registrant" => RelationLabel::Registrant,
            "registrant_contact" => RelationLabel::RegistrantContact,
            "associated_with" => RelationLabel::AssociatedWith,
            "resolves_to" => RelationLabel::ResolvesTo,
            "subdomain_of" => RelationLabel::SubdomainOf,
            "contains" => RelationLabel::Contains,
            "announces" => RelationLabel::Announces,
            "person" => RelationLabel::Person,
            "organization" => RelationLabel::Organization,
            "location" => RelationLabel::Location,
            "phone" => RelationLabel::Phone,
            "email" => RelationLabel::Email,
            "source" => RelationLabel::Source,
            other => return Err(UnknownLabel(other.to_owned())),
        };
        Ok(label)
    }
}

impl fmt::Display for RelationLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_string_round_trip() {
        for label in [
            RelationLabel::Registration,
            RelationLabel::RegistrantContact,
            RelationLabel::AssociatedWith,
            RelationLabel::SubdomainOf,
            RelationLabel::Source,
        ] {
            assert_eq!(label.as_str().parse::<RelationLabel>().unwrap(), label);
        }

        assert!("registred".parse::<RelationLabel>().is_err());
    }

    #[test]
    fn only_association_edges_are_symmetric() {
        assert!(RelationLabel::AssociatedWith.is_symmetric());
        assert!(!RelationLabel::Registration.is_symmetric());
        assert!(!RelationLabel::ResolvesTo.is_symmetric());
    }
}
