//! Host compatibility checks for plans and cases.

use crate::runner::result::SkipReason;

/// Operating system and CPU architecture of a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub os: String,
    pub arch: String,
}

impl Host {
    pub fn local() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    pub fn new(os: &str, arch: &str) -> Self {
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
        }
    }
}

fn canonical(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.as_str() {
        "darwin" | "mac" | "osx" => "macos".to_string(),
        "win32" | "win" => "windows".to_string(),
        "amd64" | "x64" => "x86_64".to_string(),
        "arm64" => "aarch64".to_string(),
        "i386" | "i686" => "x86".to_string(),
        _ => lower,
    }
}

/// Where an entity may run. Empty lists mean "anywhere".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applicability {
    pub os: Vec<String>,
    pub arch: Vec<String>,
}

impl Applicability {
    /// Combine explicit lists with `os.<name>` / `arch.<name>` tags.
    pub fn from_parts(os: &[String], arch: &[String], tags: &[String]) -> Self {
        let mut result = Self {
            os: os.to_vec(),
            arch: arch.to_vec(),
        };
        for tag in tags {
            let lower = tag.to_ascii_lowercase();
            if let Some(name) = lower.strip_prefix("os.") {
                result.os.push(name.to_string());
            } else if let Some(name) = lower.strip_prefix("arch.") {
                result.arch.push(name.to_string());
            }
        }
        result
    }

    pub fn check(&self, host: &Host) -> Result<(), SkipReason> {
        let host_os = canonical(&host.os);
        if !self.os.is_empty() && !self.os.iter().any(|o| canonical(o) == host_os) {
            return Err(SkipReason::NotForLocalOs);
        }
        let host_arch = canonical(&host.arch);
        if !self.arch.is_empty() && !self.arch.iter().any(|a| canonical(a) == host_arch) {
            return Err(SkipReason::NotForLocalArch);
        }
        Ok(())
    }
}
