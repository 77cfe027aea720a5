//! Build information reported by `virtmigrate version`

use std::fmt;

/// Version, commit and build date baked in at compile time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub build_date: &'static str,
    pub rust_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            commit: option_env!("VIRTMIGRATE_GIT_COMMIT").unwrap_or("unknown"),
            build_date: option_env!("VIRTMIGRATE_BUILD_DATE").unwrap_or("unknown"),
            rust_version: option_env!("VIRTMIGRATE_RUSTC_VERSION").unwrap_or("unknown"),
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Version:    {}", self.version)?;
        writeln!(f, "Git commit: {}", self.commit)?;
        writeln!(f, "Built:      {}", self.build_date)?;
        write!(f, "Rust:       {}", self.rust_version)
    }
}
