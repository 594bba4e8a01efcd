//! Name cleanup applied to every FQDN a data source hands back.
//!
//! External feeds return names in every imaginable shape: mixed case, IDN
//! labels, wildcard prefixes, stray whitespace. Everything entering the graph
//! goes through [`clean_fqdn`] first so the natural-key invariant holds.

use core::fmt;

use smol_str::SmolStr;

const MAX_NAME_OCTETS: usize = 253;
const MAX_LABEL_OCTETS: usize = 63;

#[derive(Debug, PartialEq, Eq)]
pub enum BadName {
    Empty,
    IdnaConversion,
    NonLdhCharacter { label: SmolStr },
    LabelTooLong { label: SmolStr },
    NameTooLong,
}

impl fmt::Display for BadName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BadName::Empty => write!(f, "empty name"),
            BadName::IdnaConversion => write!(f, "IDNA conversion failed"),
            BadName::NonLdhCharacter { label } => write!(f, "non-LDH character in label: {label}"),
            BadName::LabelTooLong { label } => write!(f, "label exceeds 63 octets: {label}"),
            BadName::NameTooLong => write!(f, "name exceeds 253 octets"),
        }
    }
}

impl std::error::Error for BadName {}

/// Normalizes a raw candidate name into canonical FQDN form.
///
/// Idempotent: feeding the output back in returns it unchanged.
pub fn clean_fqdn(raw: &str) -> Result<SmolStr, BadName> {
    let trimmed = raw.trim().trim_end_matches('.');

    // One wildcard label at most; certificate SANs routinely carry it.
    let trimmed = trimmed.strip_prefix("*.").unwrap_or(trimmed);

    if trimmed.is_empty() {
        return Err(BadName::Empty);
    }

    let ascii = if trimmed.is_ascii() {
        trimmed.to_ascii_lowercase()
    } else {
        idna::domain_to_ascii(trimmed).map_err(|_| BadName::IdnaConversion)?
    };

    if ascii.len() > MAX_NAME_OCTETS {
        return Err(BadName::NameTooLong);
    }

    for label in ascii.split('.') {
        if label.is_empty() {
            return Err(BadName::NonLdhCharacter { label: ascii.as_str().into() });
        }

        if label.len() > MAX_LABEL_OCTETS {
            return Err(BadName::LabelTooLong { label: label.into() });
        }

        let ldh = label.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if !ldh {
            return Err(BadName::NonLdhCharacter { label: label.into() });
        }
    }

    Ok(ascii.into())
}

/// Parent of a dot-separated name, if any (`a.b.c` -> `b.c`).
pub fn parent_name(name: &str) -> Option<&str> {
    name.split_once('.').map(|(_, rest)| rest).filter(|rest| rest.contains('.'))
}

/// Extracts a usable host name out of a URL-shaped candidate.
pub fn host_of_url(raw: &str) -> Option<SmolStr> {
    let url = url::Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?;
    clean_fqdn(host).ok()
}
