//! Client protocol variant, ordered so that bridging code can ask "is this
//! endpoint new enough to understand packet X".

use std::cmp::Ordering;
use std::fmt;

/// Ordered enumeration of wire-protocol dialects a client may speak.
///
/// `UNKNOWN` sorts below everything and is only valid before the first
/// version/seed packet has been processed for an endpoint (see
/// `ClientVersion` invariant in spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    Unknown,
    V5,
    V6,
    V6_0_5,
    V6_0_14,
    V7,
}

impl ProtocolVersion {
    /// Whether the upstream connect prelude must use the structured
    /// `0xEF Seed` packet rather than the raw 4-byte seed (spec.md §4.C).
    pub fn needs_seed_packet(self) -> bool {
        self >= ProtocolVersion::V6_0_14
    }

    /// Whether `ContainerOpen` carries the trailing 7.0 gump-type byte.
    pub fn is_v7(self) -> bool {
        self >= ProtocolVersion::V7
    }

    /// Whether `Drop`/`ContainerUpdate` use the wider 6.0.1.7+ layout.
    pub fn is_v6(self) -> bool {
        self >= ProtocolVersion::V6
    }
}

/// The four-component build number a client reports in its `ClientVersion`
/// string, carried in the `0xEF Seed` prelude (spec.md §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientBuild {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
    pub patch: u32,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtocolVersion::Unknown => "unknown",
            ProtocolVersion::V5 => "5",
            ProtocolVersion::V6 => "6.0.1.7",
            ProtocolVersion::V6_0_5 => "6.0.5",
            ProtocolVersion::V6_0_14 => "6.0.14",
            ProtocolVersion::V7 => "7",
        };
        f.write_str(s)
    }
}

/// One `(integer, trailing-char)` component of a dotted version string,
/// e.g. `"6.0.14"` -> `[(6,'\0'), (0,'\0'), (14,'\0')]`. Components compare
/// lexicographically; a missing component compares as `(0, '\0')`.
fn components(version: &str) -> Vec<(u64, char)> {
    version
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            let n: u64 = digits.parse().unwrap_or(0);
            let trailing = part[digits.len()..].chars().next().unwrap_or('\0');
            (n, trailing)
        })
        .collect()
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    let a = components(a);
    let b = components(b);
    let len = a.len().max(b.len());
    for i in 0..len {
        let ca = a.get(i).copied().unwrap_or((0, '\0'));
        let cb = b.get(i).copied().unwrap_or((0, '\0'));
        match ca.cmp(&cb) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Derives a [`ProtocolVersion`] from the four-component build number
/// carried in a `0xEF Seed` packet, by formatting it the same way a
/// `ClientVersion` dotted string would read.
pub fn protocol_version_from_build(build: ClientBuild) -> ProtocolVersion {
    protocol_version_from_str(&format!(
        "{}.{}.{}.{}",
        build.major, build.minor, build.revision, build.patch
    ))
}

/// Derives a [`ProtocolVersion`] from a dotted client version string, the
/// way `determine_protocol_version()` does in the original source.
pub fn protocol_version_from_str(version: &str) -> ProtocolVersion {
    if compare_versions(version, "7") != Ordering::Less {
        ProtocolVersion::V7
    } else if compare_versions(version, "6.0.14") != Ordering::Less {
        ProtocolVersion::V6_0_14
    } else if compare_versions(version, "6.0.5") != Ordering::Less {
        ProtocolVersion::V6_0_5
    } else if compare_versions(version, "6.0.1.7") != Ordering::Less {
        ProtocolVersion::V6
    } else if compare_versions(version, "1") != Ordering::Less {
        ProtocolVersion::V5
    } else {
        ProtocolVersion::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_as_expected() {
        assert!(ProtocolVersion::Unknown < ProtocolVersion::V5);
        assert!(ProtocolVersion::V5 < ProtocolVersion::V6);
        assert!(ProtocolVersion::V6 < ProtocolVersion::V6_0_5);
        assert!(ProtocolVersion::V6_0_5 < ProtocolVersion::V6_0_14);
        assert!(ProtocolVersion::V6_0_14 < ProtocolVersion::V7);
    }

    #[test]
    fn parses_dotted_versions() {
        assert_eq!(protocol_version_from_str("7.0.18.0"), ProtocolVersion::V7);
        assert_eq!(
            protocol_version_from_str("6.0.14.2"),
            ProtocolVersion::V6_0_14
        );
        assert_eq!(
            protocol_version_from_str("6.0.5.0"),
            ProtocolVersion::V6_0_5
        );
        assert_eq!(protocol_version_from_str("6.0.1.7"), ProtocolVersion::V6);
        assert_eq!(protocol_version_from_str("5.0.9"), ProtocolVersion::V5);
        assert_eq!(protocol_version_from_str("0.9"), ProtocolVersion::Unknown);
    }

    #[test]
    fn component_wise_not_lexical_string_compare() {
        // "6.0.9" > "6.0.14" as strings, but not as component-wise versions.
        assert_eq!(compare_versions("6.0.9", "6.0.14"), Ordering::Less);
    }
}
