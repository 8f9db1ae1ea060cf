use std::sync::LazyLock;

use semver::Version;

use crate::error::{Result, TunnelError};

/// Current porthole version.
pub const VERSION: &str = "0.1.0";
/// Oldest client version the server still speaks to.
pub const MIN_CLIENT_VERSION: &str = "0.1.0";

static SERVER_VERSION: LazyLock<Version> = LazyLock::new(|| {
    Version::parse(VERSION).expect("VERSION is valid semver")
});
static MIN_VERSION: LazyLock<Version> = LazyLock::new(|| {
    Version::parse(MIN_CLIENT_VERSION).expect("MIN_CLIENT_VERSION is valid semver")
});

/// Whether a client at `client_version` speaks a protocol this server
/// supports: at least the minimum supported version and no newer than the
/// server itself.
pub fn check_version_compatible(client_version: &str) -> Result<bool> {
    let version = Version::parse(client_version)
        .map_err(|_| TunnelError::Version(client_version.to_string()))?;
    Ok(version >= *MIN_VERSION && version <= *SERVER_VERSION)
}
