//! Release channels.
//!
//! Every manifest names a release type, and every update check runs against
//! a requested channel. The two share one enum, totally ordered from
//! strictest (most stable) to loosest: an update is acceptable on a channel
//! exactly when its release type is not looser than the channel
//! (`release_type <= channel`).

use serde::{Deserialize, Serialize};

/// Release track of a build or an update channel.
///
/// Declaration order is the channel order: `Debug < Stable < Beta <
/// Experimental < Canary < Nightly < Unknown`. A `Stable` channel never
/// accepts a `Nightly` manifest; a `Nightly` channel accepts everything.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseType {
    /// Local development builds
    Debug,
    /// Production releases, most tested
    #[default]
    Stable,
    /// Pre-release testing
    Beta,
    /// Feature previews
    Experimental,
    /// Frequent automated releases
    Canary,
    /// Development builds, least stable
    Nightly,
    /// Anything unrecognized; loosest of all
    Unknown,
}

impl ReleaseType {
    /// All recognized channel names, in channel order.
    pub const ALL: [ReleaseType; 7] = [
        ReleaseType::Debug,
        ReleaseType::Stable,
        ReleaseType::Beta,
        ReleaseType::Experimental,
        ReleaseType::Canary,
        ReleaseType::Nightly,
        ReleaseType::Unknown,
    ];

    /// Parse a release-type name case-insensitively.
    ///
    /// Unrecognized names map to `Unknown` rather than failing, so a
    /// manifest from a newer server generation still parses; `Unknown`
    /// is looser than every real channel and is filtered by policy.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => ReleaseType::Debug,
            "stable" => ReleaseType::Stable,
            "beta" => ReleaseType::Beta,
            "experimental" => ReleaseType::Experimental,
            "canary" => ReleaseType::Canary,
            "nightly" => ReleaseType::Nightly,
            _ => ReleaseType::Unknown,
        }
    }

    /// Lowercase name as it appears in URLs and manifests.
    pub fn name(&self) -> &'static str {
        match self {
            ReleaseType::Debug => "debug",
            ReleaseType::Stable => "stable",
            ReleaseType::Beta => "beta",
            ReleaseType::Experimental => "experimental",
            ReleaseType::Canary => "canary",
            ReleaseType::Nightly => "nightly",
            ReleaseType::Unknown => "unknown",
        }
    }

    /// Whether a manifest with this release type is acceptable on `channel`.
    pub fn is_within(&self, channel: ReleaseType) -> bool {
        *self <= channel
    }
}

impl std::fmt::Display for ReleaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!(ReleaseType::parse("Stable"), ReleaseType::Stable);
        assert_eq!(ReleaseType::parse("NIGHTLY"), ReleaseType::Nightly);
        assert_eq!(ReleaseType::parse("beta"), ReleaseType::Beta);
        assert_eq!(ReleaseType::parse(" canary "), ReleaseType::Canary);
    }

    #[test]
    fn test_parse_unrecognized_is_unknown() {
        assert_eq!(ReleaseType::parse("rc1"), ReleaseType::Unknown);
        assert_eq!(ReleaseType::parse(""), ReleaseType::Unknown);
    }

    #[test]
    fn test_channel_order() {
        assert!(ReleaseType::Debug < ReleaseType::Stable);
        assert!(ReleaseType::Stable < ReleaseType::Beta);
        assert!(ReleaseType::Beta < ReleaseType::Experimental);
        assert!(ReleaseType::Experimental < ReleaseType::Canary);
        assert!(ReleaseType::Canary < ReleaseType::Nightly);
        assert!(ReleaseType::Nightly < ReleaseType::Unknown);
    }

    #[test]
    fn test_is_within() {
        // A stable channel accepts stable and debug, nothing looser.
        assert!(ReleaseType::Stable.is_within(ReleaseType::Stable));
        assert!(ReleaseType::Debug.is_within(ReleaseType::Stable));
        assert!(!ReleaseType::Beta.is_within(ReleaseType::Stable));
        assert!(!ReleaseType::Nightly.is_within(ReleaseType::Stable));

        // A nightly channel accepts every real release type.
        for rt in ReleaseType::ALL {
            if rt != ReleaseType::Unknown {
                assert!(rt.is_within(ReleaseType::Nightly), "{rt} within nightly");
            }
        }
    }

    #[test]
    fn test_display_and_serde() {
        assert_eq!(ReleaseType::Stable.to_string(), "stable");
        assert_eq!(
            serde_json::to_string(&ReleaseType::Nightly).unwrap(),
            "\"nightly\""
        );
        let parsed: ReleaseType = serde_json::from_str("\"beta\"").unwrap();
        assert_eq!(parsed, ReleaseType::Beta);
    }

    #[test]
    fn test_default_is_stable() {
        assert_eq!(ReleaseType::default(), ReleaseType::Stable);
    }
}
