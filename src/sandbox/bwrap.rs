//! bubblewrap rendering of sandbox requests.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

use super::{forward_output, ExecutionResult, Sandbox, SandboxRequest};
use crate::config::BuildConfig;
use crate::error::BackendError;
use crate::mounts::{validate_order, MountDirective, UpperLayer};

pub const DEFAULT_SANDBOX_BINARY: &str = "bwrap";

/// Top-level directories that are symlinks into `/usr` on merged-usr systems.
const MERGED_USR_LINKS: &[&str] = &["bin", "sbin", "lib", "lib64"];

#[derive(Debug, Clone)]
pub struct BwrapSandbox {
    binary: String,
}

impl BwrapSandbox {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(
            config
                .sandbox_binary
                .as_deref()
                .unwrap_or(DEFAULT_SANDBOX_BINARY),
        )
    }

    fn locate(&self) -> Result<PathBuf> {
        which::which(&self.binary).map_err(|_| {
            BackendError::configuration(format!(
                "sandbox tool '{}' not found in PATH",
                self.binary
            ))
            .into()
        })
    }

    /// Command line arguments for `request`, excluding the binary itself.
    pub fn render(&self, request: &SandboxRequest) -> Result<Vec<String>> {
        validate_order(&request.directives)?;

        let mut args = Args::default();
        if !running_as_root() {
            args.push(["--unshare-user", "--uid", "0", "--gid", "0"]);
        }
        if !request.network {
            args.push(["--unshare-net"]);
        }
        args.push(["--die-with-parent"]);

        if request.devices {
            args.push(["--dev-bind", "/dev", "/dev"]);
        } else {
            args.push(["--dev", "/dev"]);
        }
        args.push(["--proc", "/proc"]);
        args.push(["--tmpfs", "/tmp"]);
        args.push(["--tmpfs", "/var/tmp"]);
        for dir in MERGED_USR_LINKS {
            args.push(["--symlink".to_string(), format!("usr/{}", dir), format!("/{}", dir)]);
        }

        let mut upper: Option<&UpperLayer> = None;
        for directive in &request.directives {
            match directive {
                MountDirective::Bind { source, target } => args.paths("--bind", &[source, target]),
                MountDirective::RoBind { source, target } => {
                    args.paths("--ro-bind", &[source, target])
                }
                MountDirective::OverlayLower { source, .. } => args.paths("--overlay-src", &[source]),
                MountDirective::OverlayUpper { layer, .. } => upper = Some(layer),
                MountDirective::Overlay { target } => match upper.take() {
                    Some(UpperLayer::Dir { upper, work }) => {
                        args.paths("--overlay", &[upper, work, target])
                    }
                    _ => args.paths("--tmp-overlay", &[target]),
                },
                MountDirective::Symlink {
                    link_target,
                    target,
                } => args.paths("--symlink", &[link_target, target]),
                MountDirective::TmpfsDir { target } => args.paths("--tmpfs", &[target]),
            }
        }

        args.push(["--clearenv"]);
        for (key, value) in &request.environment {
            args.push(["--setenv", key.as_str(), value.as_str()]);
        }

        args.push(["--"]);
        args.0.extend(request.argv.iter().cloned());
        Ok(args.0)
    }
}

#[derive(Default)]
struct Args(Vec<String>);

impl Args {
    fn push<I, S>(&mut self, items: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(items.into_iter().map(Into::into));
    }

    fn paths(&mut self, flag: &str, paths: &[&PathBuf]) {
        self.0.push(flag.to_string());
        self.0
            .extend(paths.iter().map(|p| p.to_string_lossy().into_owned()));
    }
}

fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

impl Sandbox for BwrapSandbox {
    fn run(&self, request: &SandboxRequest, sink: &mut (dyn Write + Send)) -> Result<ExecutionResult> {
        let binary = self.locate()?;
        let args = self.render(request)?;
        debug!("{} {}", binary.display(), args.join(" "));

        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {}", display(&binary)))?;

        let status = forward_output(&mut child, sink)
            .with_context(|| format!("running '{}' in {}", request.command_line(), display(&binary)))?;

        // Killed by a signal: no exit code, report as failure.
        Ok(ExecutionResult {
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
