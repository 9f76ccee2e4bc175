//! Gentoo, bootstrapped from stage3 snapshots with the emerge backend.

use anyhow::Result;
use tracing::debug;

use super::DistributionInstaller;
use crate::arch::Architecture;
use crate::backend::{Emerge, PackageManagerBackend, Services};
use crate::build::context::BuildContext;
use crate::build::kernel::link_kernel_images;
use crate::error::BackendError;

const BASE_PACKAGES: &[&str] = &["sys-apps/baselayout", "sec-keys/openpgp-keys-gentoo-release"];

pub struct GentooInstaller;

impl GentooInstaller {
    /// Built kernel image inside a kernel source tree.
    pub fn kernel_image(arch: Architecture) -> Result<&'static str> {
        match arch {
            Architecture::X86_64 => Ok("arch/x86/boot/bzImage"),
            Architecture::Arm64 => Ok("arch/arm64/boot/Image.gz"),
            Architecture::Arm => Ok("arch/arm/boot/zImage"),
            other => Err(unsupported(other)),
        }
    }
}

fn unsupported(arch: Architecture) -> anyhow::Error {
    BackendError::configuration(format!("architecture {} is not supported by Gentoo", arch)).into()
}

impl DistributionInstaller for GentooInstaller {
    fn pretty_name(&self) -> &'static str {
        "Gentoo"
    }

    fn filesystem(&self) -> &'static str {
        "btrfs"
    }

    fn default_release(&self) -> &'static str {
        "23.0"
    }

    fn architecture(&self, arch: Architecture) -> Result<&'static str> {
        match arch {
            Architecture::X86_64 => Ok("amd64"),
            Architecture::Arm64 => Ok("arm64"),
            Architecture::Arm => Ok("arm"),
            other => Err(unsupported(other)),
        }
    }

    fn base_packages(&self) -> &'static [&'static str] {
        BASE_PACKAGES
    }

    fn backend(&self, services: Services) -> Box<dyn PackageManagerBackend> {
        Box::new(Emerge::new(services))
    }

    fn install_packages(
        &self,
        ctx: &BuildContext,
        backend: &mut dyn PackageManagerBackend,
        packages: &[String],
    ) -> Result<()> {
        backend.install(ctx, packages)?;

        let image = Self::kernel_image(ctx.config.architecture)?;
        let linked = link_kernel_images(&ctx.root(), image)?;
        debug!("linked {} kernel image(s)", linked.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::mounts::{MountDirective, RepoAccess};
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    #[test]
    fn test_architecture_map() {
        let gentoo = GentooInstaller;
        assert_eq!(gentoo.architecture(Architecture::X86_64).unwrap(), "amd64");
        assert_eq!(gentoo.architecture(Architecture::Arm64).unwrap(), "arm64");
        assert_eq!(gentoo.architecture(Architecture::Arm).unwrap(), "arm");

        for arch in [Architecture::X86, Architecture::Riscv64, Architecture::S390x] {
            let err = gentoo.architecture(arch).unwrap_err();
            assert!(crate::error::kind_of(&err).is_some_and(BackendError::is_configuration));
            assert!(err.to_string().contains(arch.as_str()));
        }
    }

    #[test]
    fn test_facts() {
        let gentoo = GentooInstaller;
        assert_eq!(gentoo.filesystem(), "btrfs");
        assert_eq!(gentoo.default_release(), "23.0");
        assert_eq!(
            gentoo.base_packages(),
            ["sys-apps/baselayout", "sec-keys/openpgp-keys-gentoo-release"]
        );
    }

    /// Backend stand-in that "installs" a kernel source tree.
    #[derive(Default)]
    struct KernelInstalling {
        installed: Vec<String>,
    }

    impl PackageManagerBackend for KernelInstalling {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn resolve_executable(&self, _: &BuildConfig, _: Option<&Path>) -> Result<PathBuf> {
            Ok(PathBuf::from("true"))
        }
        fn feature_flags(&self, _: &BuildConfig) -> Vec<String> {
            Vec::new()
        }
        fn backend_config(&self, _: &BuildConfig) -> crate::backend::BackendConfig {
            crate::backend::BackendConfig {
                feature_flags: Vec::new(),
                environment: Default::default(),
                package_cache_dir: None,
            }
        }
        fn setup(&mut self, ctx: &BuildContext) -> Result<()> {
            ctx.ensure_root().map(|_| ())
        }
        fn sync(&mut self, _: &BuildContext, _: bool) -> Result<()> {
            Ok(())
        }
        fn install(&mut self, ctx: &BuildContext, packages: &[String]) -> Result<()> {
            self.installed.extend(packages.iter().cloned());
            fs::create_dir_all(ctx.root().join("usr/src/linux-6.12.21-gentoo/arch/x86/boot"))?;
            Ok(())
        }
        fn upgrade(&mut self, _: &BuildContext, _: &[String]) -> Result<()> {
            Ok(())
        }
        fn remove(&mut self, _: &BuildContext, _: &[String]) -> Result<()> {
            Ok(())
        }
        fn createrepo(&mut self, _: &BuildContext) -> Result<()> {
            Ok(())
        }
        fn mounts(&self, _: &BuildContext, _: RepoAccess) -> Result<Vec<MountDirective>> {
            Ok(Vec::new())
        }
        fn stage3_root(&self) -> Option<&Path> {
            None
        }
    }

    #[test]
    fn test_install_links_kernel_images() {
        let temp = TempDir::new().unwrap();
        let config = BuildConfig {
            architecture: Architecture::X86_64,
            ..BuildConfig::default()
        };
        let ctx = BuildContext::new(config, temp.path()).unwrap();
        let mut backend = KernelInstalling::default();

        GentooInstaller.setup(&ctx, &mut backend).unwrap();
        GentooInstaller.install(&ctx, &mut backend).unwrap();

        assert_eq!(backend.installed, BASE_PACKAGES);
        let vmlinuz = ctx.root().join("usr/lib/modules/6.12.21-gentoo/vmlinuz");
        assert_eq!(
            fs::read_link(&vmlinuz).unwrap(),
            PathBuf::from("../../../src/linux-6.12.21-gentoo/arch/x86/boot/bzImage")
        );

        // A rerun leaves an existing link untouched.
        fs::remove_file(&vmlinuz).unwrap();
        std::os::unix::fs::symlink("custom", &vmlinuz).unwrap();
        GentooInstaller
            .install_packages(&ctx, &mut backend, &["app-misc/jq".to_string()])
            .unwrap();
        assert_eq!(fs::read_link(&vmlinuz).unwrap(), PathBuf::from("custom"));
    }
}
