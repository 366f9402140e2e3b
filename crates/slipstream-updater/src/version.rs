//! Dotted version parsing.
//!
//! Update manifests carry versions as dotted numeric strings with up to
//! four components (`2.1`, `2.1.0.4`). Published manifests rely on this
//! exact syntax, so the type is bespoke rather than semver: a two-component
//! version sorts below its three-component sibling (`2.1 < 2.1.0`), and the
//! canonical form re-emits exactly the components that were parsed.

use std::cmp::Ordering;
use std::fmt;

/// A version of up to four dot-separated numeric components.
///
/// Absent components are internally `-1`, which places `2.1` strictly
/// below `2.1.0` under component-wise comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionQuad {
    parts: [i64; 4],
}

impl VersionQuad {
    /// The fallback version for unparsable input.
    pub const ZERO: VersionQuad = VersionQuad {
        parts: [0, 0, -1, -1],
    };

    /// Parse a version string, falling back to `0.0` on any syntax error.
    ///
    /// This is the policy every manifest field goes through: an update
    /// whose version cannot be parsed compares as `0.0` and therefore
    /// never beats an installed version.
    pub fn parse(s: &str) -> Self {
        Self::parse_strict(s).unwrap_or(Self::ZERO)
    }

    /// Parse a version string, requiring two to four numeric components.
    pub fn parse_strict(s: &str) -> Option<Self> {
        let mut parts = [-1i64; 4];
        let mut count = 0;

        for piece in s.trim().split('.') {
            if count == 4 {
                return None;
            }
            let value: i64 = piece.parse().ok()?;
            if value < 0 {
                return None;
            }
            parts[count] = value;
            count += 1;
        }

        if count < 2 {
            return None;
        }

        Some(VersionQuad { parts })
    }

    /// Construct from explicit components.
    pub fn new(major: i64, minor: i64) -> Self {
        VersionQuad {
            parts: [major, minor, -1, -1],
        }
    }

    /// Number of present components (2 to 4).
    pub fn component_count(&self) -> usize {
        self.parts.iter().take_while(|&&p| p >= 0).count()
    }
}

impl PartialOrd for VersionQuad {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionQuad {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts.cmp(&other.parts)
    }
}

impl fmt::Display for VersionQuad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().take_while(|&&p| p >= 0).enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", part)?;
        }
        Ok(())
    }
}
