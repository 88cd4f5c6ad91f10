//! Build metadata embedded by the build script, reported by `daemon version`.

/// Commit the daemon was built from (`unknown` outside a git checkout).
pub const GIT_HASH: &str = env!("PERCH_GIT_HASH");

/// Cargo profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("PERCH_BUILD_PROFILE");

/// The crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version line sent to clients, e.g. `"0.1.0 (abc1234, debug)"`.
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_mentions_all_parts() {
        let v = version_string();
        assert!(v.starts_with(VERSION));
        assert!(v.contains(GIT_HASH));
        assert!(v.ends_with(&format!("{BUILD_PROFILE})")));
    }

    #[test]
    fn test_build_profile_is_debug_under_test() {
        assert_eq!(BUILD_PROFILE, "debug");
    }
}
