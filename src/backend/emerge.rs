//! Portage (`emerge`) backend.
//!
//! `emerge` runs from an extracted stage3 snapshot and installs into the
//! build's install root, mounted at `/buildroot` with `PORTAGE_CONFIGROOT`
//! pointing there too. Portage's own sandboxing features are disabled since
//! the outer sandbox already isolates the run.

use anyhow::Result;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{BackendConfig, PackageManagerBackend, Services};
use crate::build::context::{BuildContext, SANDBOX_INSTALL_ROOT};
use crate::build::filesystem::dir_is_empty;
use crate::config::BuildConfig;
use crate::distribution;
use crate::error::{kind_of, BackendError};
use crate::mounts::{compose, MountContext, MountDirective, RepoAccess};
use crate::sandbox::{ExecutionResult, Invocation, Invoker};
use crate::stage3::cache::{ensure_package_cache_layout, REPOS_SUBDIR};
use crate::stage3::{CacheLease, GentooStage3Resolver, SnapshotResolver, Stage3Cache};

/// Overrides the emerge executable.
pub const EMERGE_BIN_ENV: &str = "EMERGE_BIN";

const FEATURES: &[&str] = &[
    "-sandbox",
    "-pid-sandbox",
    "-ipc-sandbox",
    "-network-sandbox",
    "-usersandbox",
    "-userpriv",
    "-userfetch",
    "-usersync",
    "-news",
    "parallel-install",
];

const NO_DOCS_FEATURES: &[&str] = &["noman", "nodoc", "noinfo"];

/// Searched in order, relative to the tool root.
const TOOL_DIRS: &[&str] = &["usr/bin", "bin", "usr/sbin"];

const SYNC_HOME: &str = "/var/lib/portage/home";

/// Registers the shared binary package cache as the preferred binhost.
const LOCAL_BINREPO: &str = "[local]\npriority = 9999\nsync-uri = file:///var/cache/binpkgs\n";

pub struct Emerge {
    services: Services,
    resolver: Box<dyn SnapshotResolver>,
    cache: Option<Stage3Cache>,
    root: Option<PathBuf>,
    lease: Option<CacheLease>,
    output: Box<dyn Write + Send>,
}

impl Emerge {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            resolver: Box::new(GentooStage3Resolver::new()),
            cache: None,
            root: None,
            lease: None,
            output: Box::new(io::stdout()),
        }
    }

    pub fn with_resolver(mut self, resolver: Box<dyn SnapshotResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Where package manager output is forwarded. Defaults to stdout.
    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = output;
        self
    }

    fn require_root(&self) -> Result<&Path> {
        self.root.as_deref().ok_or_else(|| {
            BackendError::configuration("emerge backend used before setup").into()
        })
    }

    fn repos_dir(&self, config: &BuildConfig) -> Result<PathBuf> {
        Ok(match &config.package_cache_dir {
            Some(dir) => dir.join(REPOS_SUBDIR),
            None => self.require_root()?.join("var/db/repos"),
        })
    }

    fn verbosity(config: &BuildConfig) -> [&'static str; 2] {
        if config.debug {
            ["--verbose", "--quiet-fail=n"]
        } else {
            ["--quiet-build", "--quiet"]
        }
    }

    fn root_arg() -> String {
        format!("--root={}", SANDBOX_INSTALL_ROOT)
    }

    /// Arguments of an install run, before the package list.
    pub fn install_args(config: &BuildConfig) -> Vec<String> {
        let mut args: Vec<String> = [
            "--buildpkg=y",
            "--usepkg=y",
            "--binpkg-respect-use=y",
            "--jobs",
            "--load-average",
            "--root-deps=rdeps",
            "--with-bdeps-auto=n",
            "--verbose-conflicts",
            "--noreplace",
            "--update",
            "--newuse",
            "--ask=n",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(Self::verbosity(config).iter().map(|s| s.to_string()));
        args.push(Self::root_arg());
        args
    }

    fn upgrade_args(config: &BuildConfig) -> Vec<String> {
        let mut args: Vec<String> = [
            "--buildpkg=y",
            "--usepkg=y",
            "--binpkg-respect-use=y",
            "--update",
            "--deep",
            "--newuse",
            "--ask=n",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(Self::verbosity(config).iter().map(|s| s.to_string()));
        args.push(Self::root_arg());
        args
    }

    fn remove_args(config: &BuildConfig) -> Vec<String> {
        let mut args = vec!["--unmerge".to_string(), "--ask=n".to_string()];
        args.extend(Self::verbosity(config).iter().map(|s| s.to_string()));
        args.push(Self::root_arg());
        args
    }

    /// Run `tool args..` in the sandbox and return its result unchecked.
    fn run(
        &mut self,
        ctx: &BuildContext,
        tool: Tool,
        args: Vec<String>,
        repos: RepoAccess,
        environment: BTreeMap<String, String>,
    ) -> Result<(String, ExecutionResult)> {
        let config = &ctx.config;
        let stage3_root = self.require_root()?;
        let executable = match tool {
            Tool::Emerge => self.resolve_executable(config, Some(stage3_root))?,
            Tool::Emaint => locate_tool(stage3_root, "emaint"),
        };
        let executable = executable.to_string_lossy().into_owned();

        let mut argv = vec![executable.clone()];
        argv.extend(args);
        let invocation = Invocation {
            directives: self.mounts(ctx, repos)?,
            argv,
            environment,
            diagnostic_argv: match tool {
                Tool::Emerge => Some(vec![executable, "--info".to_string()]),
                Tool::Emaint => None,
            },
        };

        let sandbox = self.services.sandbox.clone();
        let invoker = Invoker::new(
            sandbox.as_ref(),
            self.backend_config(config).environment,
            config.debug,
        );
        let result = invoker.invoke(&invocation, self.output.as_mut())?;
        Ok((invocation.argv.join(" "), result))
    }

    fn run_checked(&mut self, ctx: &BuildContext, operation: &str, args: Vec<String>) -> Result<()> {
        let (command, result) = self.run(ctx, Tool::Emerge, args, RepoAccess::ReadOnly, BTreeMap::new())?;
        result.check(operation, &command)?;
        Ok(())
    }

    fn register_local_binrepo(ctx: &BuildContext) -> Result<PathBuf> {
        let dir = ctx
            .sandbox_tree()
            .join("installroot/etc/portage/binrepos.conf");
        fs::create_dir_all(&dir).map_err(|e| {
            BackendError::configuration(format!("cannot create {}: {}", dir.display(), e))
        })?;
        let conf = dir.join("local.conf");
        fs::write(&conf, LOCAL_BINREPO).map_err(|e| {
            BackendError::configuration(format!("cannot write {}: {}", conf.display(), e))
        })?;
        Ok(conf)
    }
}

#[derive(Clone, Copy)]
enum Tool {
    Emerge,
    Emaint,
}

/// In-sandbox path of `name` if the tool root ships it, else the bare name.
fn locate_tool(tool_root: &Path, name: &str) -> PathBuf {
    TOOL_DIRS
        .iter()
        .find(|dir| fs::symlink_metadata(tool_root.join(dir).join(name)).is_ok())
        .map(|dir| Path::new("/").join(dir).join(name))
        .unwrap_or_else(|| PathBuf::from(name))
}

impl PackageManagerBackend for Emerge {
    fn name(&self) -> &'static str {
        "emerge"
    }

    fn resolve_executable(&self, config: &BuildConfig, tool_root: Option<&Path>) -> Result<PathBuf> {
        if let Some(value) = config.env_var(EMERGE_BIN_ENV) {
            if value.trim().is_empty() {
                return Err(BackendError::configuration(format!(
                    "{} is set but empty",
                    EMERGE_BIN_ENV
                ))
                .into());
            }
            return Ok(PathBuf::from(value));
        }
        Ok(match tool_root {
            Some(root) => locate_tool(root, "emerge"),
            None => PathBuf::from("emerge"),
        })
    }

    fn feature_flags(&self, config: &BuildConfig) -> Vec<String> {
        let mut flags: Vec<String> = FEATURES.iter().map(|s| s.to_string()).collect();
        if !config.with_docs {
            flags.extend(NO_DOCS_FEATURES.iter().map(|s| s.to_string()));
        }
        flags
    }

    fn backend_config(&self, config: &BuildConfig) -> BackendConfig {
        let feature_flags = self.feature_flags(config);
        let mut environment = BTreeMap::from([
            ("PORTAGE_CONFIGROOT".to_string(), SANDBOX_INSTALL_ROOT.to_string()),
            ("GPG_VERIFY_USER_DROP".to_string(), "root".to_string()),
            ("GPG_VERIFY_GROUP_DROP".to_string(), "root".to_string()),
            ("FEATURES".to_string(), feature_flags.join(" ")),
        ]);
        environment.extend(config.environment.clone());
        BackendConfig {
            feature_flags,
            environment,
            package_cache_dir: config.package_cache_dir.clone(),
        }
    }

    fn setup(&mut self, ctx: &BuildContext) -> Result<()> {
        let config = &ctx.config;
        // Unmapped architectures fail here, before any network access.
        let arch = distribution::installer(config.distribution).architecture(config.architecture)?;

        let cache_root = config.package_cache_dir_or_default();
        let mut cache = match self.cache.take() {
            Some(cache) if cache.dir() == cache_root.join("stage3") => cache,
            _ => Stage3Cache::open(&cache_root)?,
        };

        let transport = self.services.transport.clone();
        let snapshot = match cache.retained() {
            Some(snapshot) => snapshot.clone(),
            None => self
                .resolver
                .resolve_latest(arch, config.mirror.as_deref(), transport.as_ref())?,
        };

        // Our own shared lock would block the upgrade to exclusive. The root
        // is only usable under that lock, so it goes with it.
        self.lease = None;
        self.root = None;
        let prepared = cache.prepare(&snapshot, transport.as_ref(), config.tools_tree.as_deref())?;

        if let Some(dir) = &config.package_cache_dir {
            ensure_package_cache_layout(dir)?;
        }
        let install_root = ctx.ensure_root()?;

        info!(
            "stage3 {} ready at {} (install root {})",
            snapshot.timestamp_id,
            prepared.root.display(),
            install_root.display()
        );
        self.root = Some(prepared.root);
        self.lease = Some(prepared.lease);
        self.cache = Some(cache);
        Ok(())
    }

    fn sync(&mut self, ctx: &BuildContext, force: bool) -> Result<()> {
        self.require_root()?;
        let gentoo = self.repos_dir(&ctx.config)?.join("gentoo");
        let mandatory = force || !gentoo.is_dir() || dir_is_empty(&gentoo);
        debug!("syncing repositories (mandatory: {})", mandatory);

        let environment = BTreeMap::from([("HOME".to_string(), SYNC_HOME.to_string())]);
        let outcome = self
            .run(
                ctx,
                Tool::Emerge,
                vec!["--sync".to_string()],
                RepoAccess::Writable,
                environment,
            )
            .and_then(|(command, result)| result.check("sync", &command));

        match outcome {
            Ok(_) => Ok(()),
            Err(err) if mandatory => Err(err),
            Err(err) => match kind_of(&err) {
                Some(BackendError::Network { .. } | BackendError::Invocation { .. }) => {
                    warn!("repository sync failed, using existing metadata: {:#}", err);
                    Ok(())
                }
                _ => Err(err),
            },
        }
    }

    fn install(&mut self, ctx: &BuildContext, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            debug!("nothing to install");
            return Ok(());
        }
        let mut args = Self::install_args(&ctx.config);
        args.extend(packages.iter().cloned());
        self.run_checked(ctx, "install", args)
    }

    fn upgrade(&mut self, ctx: &BuildContext, packages: &[String]) -> Result<()> {
        let mut args = Self::upgrade_args(&ctx.config);
        if packages.is_empty() {
            args.push("@world".to_string());
        } else {
            args.extend(packages.iter().cloned());
        }
        self.run_checked(ctx, "upgrade", args)
    }

    fn remove(&mut self, ctx: &BuildContext, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            debug!("nothing to remove");
            return Ok(());
        }
        let mut args = Self::remove_args(&ctx.config);
        args.extend(packages.iter().cloned());
        self.run_checked(ctx, "remove", args)
    }

    fn createrepo(&mut self, ctx: &BuildContext) -> Result<()> {
        let (command, result) = self.run(
            ctx,
            Tool::Emaint,
            vec!["binhost".to_string(), "--fix".to_string()],
            RepoAccess::ReadOnly,
            BTreeMap::new(),
        )?;
        result.check("createrepo", &command)?;

        let conf = Self::register_local_binrepo(ctx)?;
        info!("registered local binary repository in {}", conf.display());

        self.sync(ctx, ctx.config.force_sync)
    }

    fn mounts(&self, ctx: &BuildContext, repos: RepoAccess) -> Result<Vec<MountDirective>> {
        let install_root = ctx.root();
        let sandbox_tree = ctx.sandbox_tree();
        compose(&MountContext {
            stage3_root: self.require_root()?,
            install_root: &install_root,
            sandbox_tree: &sandbox_tree,
            package_cache_dir: ctx.config.package_cache_dir.as_deref(),
            policy: ctx.config.config_policy,
            repos,
        })
    }

    fn stage3_root(&self) -> Option<&Path> {
        self.root.as_deref()
    }
}
