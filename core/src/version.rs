//! Build and wire protocol versions

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bumped whenever the frame layout or a message body changes shape
pub const PROTOCOL_VERSION: u32 = 1;

/// Commit the binary was built from, when the build sets `GIT_HASH`
pub const GIT_HASH: Option<&str> = option_env!("GIT_HASH");

pub const BUILD_PROFILE: &str = if cfg!(debug_assertions) { "debug" } else { "release" };

/// e.g. `bftkv v0.1.0 (protocol 1) 1a2b3c4d [debug]`
pub fn version_string() -> String {
    let commit = GIT_HASH
        .map(|hash| format!(" {}", hash.get(..8).unwrap_or(hash)))
        .unwrap_or_default();
    let profile = if cfg!(debug_assertions) { " [debug]" } else { "" };

    format!("bftkv v{} (protocol {}){}{}", VERSION, PROTOCOL_VERSION, commit, profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string() {
        let version = version_string();
        assert!(version.starts_with(&format!("bftkv v{} ", VERSION)));
        assert!(version.contains("(protocol 1)"));
        assert_eq!(version.ends_with("[debug]"), BUILD_PROFILE == "debug");
    }
}
