//! Canonical target architectures.
//!
//! Distributions translate these into their own naming through
//! [`DistributionInstaller::architecture`](crate::distribution::DistributionInstaller::architecture).

use anyhow::Result;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Architecture {
    X86_64,
    X86,
    Arm64,
    Arm,
    Riscv64,
    Ppc64Le,
    S390x,
    Loongarch64,
}

impl Architecture {
    pub const ALL: &'static [Architecture] = &[
        Self::X86_64,
        Self::X86,
        Self::Arm64,
        Self::Arm,
        Self::Riscv64,
        Self::Ppc64Le,
        Self::S390x,
        Self::Loongarch64,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86-64",
            Self::X86 => "x86",
            Self::Arm64 => "arm64",
            Self::Arm => "arm",
            Self::Riscv64 => "riscv64",
            Self::Ppc64Le => "ppc64-le",
            Self::S390x => "s390x",
            Self::Loongarch64 => "loongarch64",
        }
    }

    /// Architecture of the running host.
    pub fn native() -> Result<Self> {
        std::env::consts::ARCH.parse()
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let arch = match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "x86-64" | "amd64" => Self::X86_64,
            "x86" | "i686" | "i386" => Self::X86,
            "arm64" | "aarch64" => Self::Arm64,
            "arm" | "armv7" | "armv7l" => Self::Arm,
            "riscv64" => Self::Riscv64,
            "ppc64-le" | "ppc64le" | "powerpc64" => Self::Ppc64Le,
            "s390x" => Self::S390x,
            "loongarch64" => Self::Loongarch64,
            other => {
                return Err(
                    BackendError::configuration(format!("unknown architecture '{}'", other)).into(),
                )
            }
        };
        Ok(arch)
    }
}

impl TryFrom<String> for Architecture {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("x86_64".parse::<Architecture>().unwrap(), Architecture::X86_64);
        assert_eq!("aarch64".parse::<Architecture>().unwrap(), Architecture::Arm64);
        assert_eq!("arm".parse::<Architecture>().unwrap(), Architecture::Arm);
    }

    #[test]
    fn test_display_round_trips() {
        for arch in Architecture::ALL {
            assert_eq!(arch.to_string().parse::<Architecture>().unwrap(), *arch);
        }
    }

    #[test]
    fn test_unknown_is_configuration_error() {
        let err = "sparc".parse::<Architecture>().unwrap_err();
        assert!(crate::error::kind_of(&err).is_some_and(BackendError::is_configuration));
    }
}
