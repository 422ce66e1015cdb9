//! Manifest version compatibility checking.

use anyhow::bail;

/// The ninja feature level this executor implements, compared against the
/// manifest's `ninja_required_version`.
pub const VERSION: &str = "1.10.2";

/// Extract the leading MAJOR.MINOR pair from a version string.
pub fn parse_version(version: &str) -> (u32, u32) {
    let mut parts = version.split('.');
    let major = parts
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    let minor = parts
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    (major, minor)
}

/// Fail if the manifest requires a newer executor than this binary.
pub fn check_version(required: &str) -> anyhow::Result<()> {
    let (bin_major, bin_minor) = parse_version(VERSION);
    let (file_major, file_minor) = parse_version(required);

    if bin_major > file_major {
        eprintln!(
            "warning: executor version ({}) greater than build file ninja_required_version ({}); versions may be incompatible",
            VERSION, required
        );
        return Ok(());
    }

    if (bin_major == file_major && bin_minor < file_minor) || bin_major < file_major {
        bail!(
            "executor version ({}) incompatible with build file ninja_required_version ({})",
            VERSION,
            required
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_major_minor() {
        assert_eq!(parse_version("1.10.2"), (1, 10));
        assert_eq!(parse_version("1.5"), (1, 5));
        assert_eq!(parse_version("2"), (2, 0));
        assert_eq!(parse_version("bogus"), (0, 0));
    }

    #[test]
    fn accepts_older_requirements() {
        check_version("1.3").unwrap();
        check_version("1.10").unwrap();
        check_version("0.9").unwrap();
    }

    #[test]
    fn rejects_newer_requirements() {
        assert!(check_version("1.11").is_err());
        assert!(check_version("2.0").is_err());
    }
}
