//! Property-based tests for slipstream-updater.
//!
//! These tests use proptest to verify correctness properties across
//! randomly generated inputs.
//!
//! # Properties Tested
//!
//! - Signed stream round-trip and tamper detection
//! - Version parse/display round-trip and ordering consistency
//! - Archive member path safety
//! - Built packages always verify after unpacking

#![cfg(test)]

use proptest::prelude::*;

use crate::install::is_unsafe_member;
use crate::signed::testkey::keypair;
use crate::signed::{read_verified, sign_bytes};
use crate::version::VersionQuad;

// =============================================================================
// Generators
// =============================================================================

/// Random payload bytes (possibly empty, up to 4KB).
fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..4096)
}

/// Random strict version string with 2 to 4 components.
fn arb_version_string() -> impl Strategy<Value = String> {
    prop::collection::vec(0u32..1000, 2..=4)
        .prop_map(|parts| parts.iter().map(u32::to_string).collect::<Vec<_>>().join("."))
}

/// Random component arrays for ordering checks.
fn arb_components() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(0u32..50, 2..=4)
}

/// Random relative file name made of safe segments.
fn arb_safe_member() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z][a-z0-9]{0,8}", 1..4).prop_map(|segments| segments.join("/"))
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Signing then verifying any payload yields the payload back.
    #[test]
    fn prop_signed_roundtrip(payload in arb_payload()) {
        let (private, public) = keypair();
        let signed = sign_bytes(&payload, private).unwrap();
        let recovered = read_verified(std::io::Cursor::new(&signed), &public).unwrap();
        prop_assert_eq!(recovered, payload);
    }

    /// Flipping any single byte after the header makes verification fail.
    #[test]
    fn prop_signed_corruption_detected(
        payload in prop::collection::vec(any::<u8>(), 1..1024),
        flip in any::<prop::sample::Index>(),
    ) {
        let (private, public) = keypair();
        let mut signed = sign_bytes(&payload, private).unwrap();
        let idx = 4 + flip.index(signed.len() - 4);
        signed[idx] ^= 0x01;
        prop_assert!(read_verified(std::io::Cursor::new(&signed), &public).is_err());
    }
}

proptest! {
    /// Strict version strings survive a parse/display round-trip.
    #[test]
    fn prop_version_roundtrip(s in arb_version_string()) {
        let parsed = VersionQuad::parse_strict(&s).unwrap();
        prop_assert_eq!(parsed.to_string(), s);
    }

    /// Version ordering agrees with zero-padded component ordering, except
    /// that absent components sort below explicit zeros.
    #[test]
    fn prop_version_ordering(a in arb_components(), b in arb_components()) {
        let key = |parts: &[u32]| {
            let mut padded = [-1i64; 4];
            for (slot, &part) in padded.iter_mut().zip(parts) {
                *slot = i64::from(part);
            }
            padded
        };
        let to_string = |parts: &[u32]| {
            parts.iter().map(u32::to_string).collect::<Vec<_>>().join(".")
        };

        let va = VersionQuad::parse(&to_string(&a));
        let vb = VersionQuad::parse(&to_string(&b));
        prop_assert_eq!(va.cmp(&vb), key(&a).cmp(&key(&b)));
    }

    /// Safe member names are accepted; every traversal decoration of them
    /// is refused.
    #[test]
    fn prop_member_path_safety(name in arb_safe_member()) {
        prop_assert!(!is_unsafe_member(&name));
        let with_parent_unix = format!("../{}", name);
        let with_parent_windows = format!("..\\{}", name);
        let with_leading_slash = format!("/{}", name);
        let with_trailing_parent = format!("{}/../x", name);
        prop_assert!(is_unsafe_member(&with_parent_unix));
        prop_assert!(is_unsafe_member(&with_parent_windows));
        prop_assert!(is_unsafe_member(&with_leading_slash));
        prop_assert!(is_unsafe_member(&with_trailing_parent));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Any built package unpacks into a tree the verifier accepts.
    #[test]
    fn prop_built_package_verifies(
        files in prop::collection::hash_map(arb_safe_member(), arb_payload(), 1..6),
    ) {
        let (private, public) = keypair();

        let src = tempfile::tempdir().unwrap();
        for (rel, contents) in &files {
            let path = src.path().join(rel);
            // A generated name can be both a file and a directory prefix of
            // another; skip colliding entries.
            if let Some(parent) = path.parent() {
                if std::fs::create_dir_all(parent).is_err() {
                    continue;
                }
            }
            if path.is_dir() || std::fs::write(&path, contents).is_err() {
                continue;
            }
        }

        let template = crate::manifest::UpdateInfo {
            displayname: "proptest".to_string(),
            version: "2.0".to_string(),
            release_time: chrono::DateTime::UNIX_EPOCH,
            release_type: "stable".to_string(),
            compressed_size: 0,
            md5: None,
            sha256: None,
            remote_urls: Some(vec!["https://updates.example.com/stable/package.zip".into()]),
            uncompressed_size: 0,
            files: None,
        };

        let out = tempfile::tempdir().unwrap();
        let remote =
            crate::builder::build_package(src.path(), &template, out.path(), private).unwrap();

        let staging = tempfile::tempdir().unwrap();
        crate::install::unpack_archive(&out.path().join(crate::builder::PACKAGE_NAME), staging.path())
            .unwrap();
        prop_assert!(crate::verify::verify_unpacked_tree(
            staging.path(),
            Some(&remote),
            &public,
            false,
        )
        .is_ok());
    }
}
