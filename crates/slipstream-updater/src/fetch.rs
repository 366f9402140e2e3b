//! Remote manifest fetching and release policy.
//!
//! Downloads a signed manifest from a list of candidate URLs, splicing the
//! requested channel into recognizable URL patterns, and applies the
//! channel/version acceptance policy. A policy miss is the normal "no
//! update" answer, not an error.

use tracing::{debug, info};

use crate::channel::ReleaseType;
use crate::config::UpdaterConfig;
use crate::error::UpdateError;
use crate::manifest::UpdateInfo;
use crate::signed;

/// Header carrying the installation id on every manifest request.
const INSTALL_ID_HEADER: &str = "X-Install-ID";

/// Replace channel-named path segments of a manifest URL.
///
/// A URL like `https://updates.example.com/stable/manifest` carries its
/// channel as a path segment; any segment matching a recognized release
/// type name (case-insensitively) is replaced with the requested
/// channel's lowercase name. URLs without such a segment pass unchanged.
pub(crate) fn substitute_channel(url: &str, channel: ReleaseType) -> String {
    let (prefix, path) = match url.find("://") {
        Some(idx) => {
            let after = &url[idx + 3..];
            match after.find('/') {
                Some(host_end) => (&url[..idx + 3 + host_end], &url[idx + 3 + host_end..]),
                None => return url.to_string(),
            }
        }
        None => ("", url),
    };

    let replaced: Vec<String> = path
        .split('/')
        .map(|segment| {
            let is_channel_name = ReleaseType::ALL
                .iter()
                .any(|rt| segment.eq_ignore_ascii_case(rt.name()));
            if is_channel_name {
                channel.name().to_string()
            } else {
                segment.to_string()
            }
        })
        .collect();

    format!("{prefix}{}", replaced.join("/"))
}

/// The User-Agent for update traffic: `<appname> v<selfver>[ -<install_id>]`.
pub(crate) fn user_agent(config: &UpdaterConfig, install_id: Option<&str>) -> String {
    match install_id {
        Some(id) => format!("{} v{} -{}", config.app_name, config.self_version, id),
        None => format!("{} v{}", config.app_name, config.self_version),
    }
}

/// Fetch and verify one candidate manifest URL.
pub(crate) fn fetch_manifest(
    client: &reqwest::blocking::Client,
    url: &str,
    install_id: Option<&str>,
    key: &rsa::RsaPublicKey,
) -> Result<UpdateInfo, UpdateError> {
    debug!(url, "fetching update manifest");

    let mut request = client.get(url);
    if let Some(id) = install_id {
        request = request.header(INSTALL_ID_HEADER, id);
    }

    let response = request.send()?;
    if !response.status().is_success() {
        return Err(UpdateError::Transport(format!(
            "GET {url} returned status {}",
            response.status()
        )));
    }

    let body = response.bytes()?;
    let payload = signed::read_verified(std::io::Cursor::new(body.as_ref()), key)?;
    let manifest: UpdateInfo = serde_json::from_slice(&payload)?;

    info!(
        url,
        version = %manifest.parsed_version(),
        release_type = %manifest.parsed_release_type(),
        "manifest fetched and verified"
    );
    Ok(manifest)
}

/// Release acceptance policy for a fetched manifest.
///
/// Rejections here are policy, not errors: the caller treats `false` as
/// "no update available".
pub(crate) fn accepts_update(
    config: &UpdaterConfig,
    channel: ReleaseType,
    update: &UpdateInfo,
) -> bool {
    if update.parsed_version() <= config.parsed_self_version() {
        debug!(
            offered = %update.parsed_version(),
            current = %config.parsed_self_version(),
            "update not newer than running version"
        );
        return false;
    }

    // Debug builds only ever follow debug manifests; anything else is a
    // release/debug channel mix-up.
    if config.self_release_type == ReleaseType::Debug
        && !update
            .release_type
            .eq_ignore_ascii_case(ReleaseType::Debug.name())
    {
        debug!(offered = %update.release_type, "non-debug update refused by debug build");
        return false;
    }

    let release_type = update.parsed_release_type();
    if !release_type.is_within(channel) {
        info!(
            release_type = %release_type,
            channel = %channel,
            "update release type looser than requested channel"
        );
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn update(version: &str, release_type: &str) -> UpdateInfo {
        UpdateInfo {
            displayname: "demo".to_string(),
            version: version.to_string(),
            release_time: DateTime::UNIX_EPOCH,
            release_type: release_type.to_string(),
            compressed_size: 0,
            md5: None,
            sha256: None,
            remote_urls: Some(vec![]),
            uncompressed_size: 0,
            files: None,
        }
    }

    fn config(self_version: &str, self_rt: ReleaseType) -> UpdaterConfig {
        let mut config = UpdaterConfig::for_app("demo", self_version);
        config.self_release_type = self_rt;
        config
    }

    #[test]
    fn test_substitute_channel_in_path() {
        assert_eq!(
            substitute_channel(
                "https://updates.example.com/stable/manifest",
                ReleaseType::Beta
            ),
            "https://updates.example.com/beta/manifest"
        );
        assert_eq!(
            substitute_channel(
                "https://updates.example.com/releases/Nightly/app/manifest",
                ReleaseType::Stable
            ),
            "https://updates.example.com/releases/stable/app/manifest"
        );
    }

    #[test]
    fn test_substitute_channel_leaves_host_alone() {
        assert_eq!(
            substitute_channel("https://stable.example.com/manifest", ReleaseType::Beta),
            "https://stable.example.com/manifest"
        );
        assert_eq!(
            substitute_channel("https://stable.example.com", ReleaseType::Beta),
            "https://stable.example.com"
        );
    }

    #[test]
    fn test_substitute_channel_no_match() {
        let url = "https://updates.example.com/v2/manifest";
        assert_eq!(substitute_channel(url, ReleaseType::Nightly), url);
    }

    #[test]
    fn test_user_agent() {
        let config = config("1.2.3.4", ReleaseType::Stable);
        assert_eq!(user_agent(&config, None), "demo v1.2.3.4");
        assert_eq!(
            user_agent(&config, Some("abc123")),
            "demo v1.2.3.4 -abc123"
        );
    }

    #[test]
    fn test_policy_rejects_not_newer() {
        let config = config("2.0", ReleaseType::Stable);
        assert!(!accepts_update(
            &config,
            ReleaseType::Stable,
            &update("2.0", "stable")
        ));
        assert!(!accepts_update(
            &config,
            ReleaseType::Stable,
            &update("1.9.9.9", "stable")
        ));
        assert!(accepts_update(
            &config,
            ReleaseType::Stable,
            &update("2.0.0.1", "stable")
        ));
    }

    #[test]
    fn test_policy_rejects_unparsable_version() {
        let config = config("1.0", ReleaseType::Stable);
        // Unparsable reads as 0.0, which never beats an installed version.
        assert!(!accepts_update(
            &config,
            ReleaseType::Stable,
            &update("not.a.version.at.all", "stable")
        ));
    }

    #[test]
    fn test_policy_debug_isolation() {
        let config = config("1.0", ReleaseType::Debug);
        assert!(!accepts_update(
            &config,
            ReleaseType::Nightly,
            &update("2.0", "stable")
        ));
        assert!(accepts_update(
            &config,
            ReleaseType::Nightly,
            &update("2.0", "Debug")
        ));
    }

    #[test]
    fn test_policy_channel_downshift() {
        let config = config("1.0", ReleaseType::Stable);
        // Nightly > Stable: a stable channel never takes a nightly build.
        assert!(!accepts_update(
            &config,
            ReleaseType::Stable,
            &update("9.9.9.9", "Nightly")
        ));
        // The same manifest is fine on a nightly channel.
        assert!(accepts_update(
            &config,
            ReleaseType::Nightly,
            &update("9.9.9.9", "Nightly")
        ));
    }

    #[test]
    fn test_policy_unrecognized_release_type() {
        let config = config("1.0", ReleaseType::Stable);
        // Unknown is looser than every channel and is always refused.
        assert!(!accepts_update(
            &config,
            ReleaseType::Nightly,
            &update("2.0", "rc-candidate")
        ));
    }
}
