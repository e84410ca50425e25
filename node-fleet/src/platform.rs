//! Platform-specific naming for cached binaries and release archives

use crate::error::ArtifactError;
use crate::version::Version;

/// Default release download location; `{version}`, `{family}`, `{os}`,
/// `{arch}` and `{exe}` are substituted.
pub const DEFAULT_DOWNLOAD_URL_TEMPLATE: &str =
    "https://github.com/storj/storj/releases/download/v{version}/{family}_{os}_{arch}{exe}.zip";

/// Naming rules for one operating system / architecture pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    os: &'static str,
    arch: &'static str,
    exe_suffix: &'static str,
}

impl Platform {
    /// Platform of the running process
    pub fn current() -> Result<Self, ArtifactError> {
        Self::resolve(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Maps a Rust OS/arch pair onto release naming
    pub fn resolve(os: &str, arch: &str) -> Result<Self, ArtifactError> {
        let release_arch = match (os, arch) {
            ("linux", "x86_64") | ("windows", "x86_64") | ("freebsd", "x86_64") => "amd64",
            ("linux", "aarch64") => "arm64",
            ("linux", "arm") => "arm",
            _ => {
                return Err(ArtifactError::UnsupportedPlatform {
                    os: os.to_string(),
                    arch: arch.to_string(),
                })
            }
        };

        Ok(match os {
            "windows" => Platform { os: "windows", arch: release_arch, exe_suffix: ".exe" },
            "freebsd" => Platform { os: "freebsd", arch: release_arch, exe_suffix: "" },
            _ => Platform { os: "linux", arch: release_arch, exe_suffix: "" },
        })
    }

    /// File name of the cached binary for `version`, e.g. `storagenode-1.76.2`
    pub fn binary_name(&self, family: &str, version: &Version) -> String {
        format!("{family}-{version}{}", self.exe_suffix)
    }

    /// Name of the single executable entry inside a release archive
    pub fn archive_entry_name(&self, family: &str) -> String {
        format!("{family}{}", self.exe_suffix)
    }

    /// Fills the download URL template for `version`
    pub fn download_url(&self, template: &str, family: &str, version: &Version) -> String {
        template
            .replace("{version}", version.as_str())
            .replace("{family}", family)
            .replace("{os}", self.os)
            .replace("{arch}", self.arch)
            .replace("{exe}", self.exe_suffix)
    }
}
