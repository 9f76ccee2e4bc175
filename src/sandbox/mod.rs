//! Running commands inside a composed sandbox view.
//!
//! [`Sandbox`] executes one [`SandboxRequest`]; [`BwrapSandbox`] is the
//! bubblewrap implementation. [`Invoker`] sits on top and owns the
//! environment precedence and the diagnostic pre-run.

pub mod bwrap;

pub use bwrap::BwrapSandbox;

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::process::{Child, ExitStatus};
use std::sync::Mutex;
use std::thread;
use tracing::{debug, info};

use crate::error::BackendError;
use crate::mounts::MountDirective;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRequest {
    pub directives: Vec<MountDirective>,
    pub network: bool,
    pub devices: bool,
    pub environment: BTreeMap<String, String>,
    pub argv: Vec<String>,
}

impl SandboxRequest {
    /// Request with network and devices enabled and an empty environment.
    pub fn new(directives: Vec<MountDirective>, argv: Vec<String>) -> Self {
        Self {
            directives,
            network: true,
            devices: true,
            environment: BTreeMap::new(),
            argv,
        }
    }

    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into an invocation error.
    pub fn check(self, operation: &str, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(BackendError::Invocation {
                operation: operation.to_string(),
                command: command.to_string(),
                exit_code: self.exit_code,
            }
            .into())
        }
    }
}

pub trait Sandbox: Send + Sync {
    /// Run the request, forwarding its stdout and stderr to `sink`.
    ///
    /// A non-zero exit is reported in the result. Only failing to start the
    /// sandbox at all is an error.
    fn run(&self, request: &SandboxRequest, sink: &mut (dyn Write + Send)) -> Result<ExecutionResult>;
}

/// One package manager call, before environment merging.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub directives: Vec<MountDirective>,
    pub argv: Vec<String>,
    /// Per-call overrides; win over every other environment source.
    pub environment: BTreeMap<String, String>,
    /// Run first in diagnostic mode, result ignored.
    pub diagnostic_argv: Option<Vec<String>>,
}

pub struct Invoker<'a> {
    sandbox: &'a dyn Sandbox,
    environment: BTreeMap<String, String>,
    debug: bool,
}

impl<'a> Invoker<'a> {
    /// `environment` is the backend defaults already overlaid with the
    /// caller's configured environment.
    pub fn new(sandbox: &'a dyn Sandbox, environment: BTreeMap<String, String>, debug: bool) -> Self {
        Self {
            sandbox,
            environment,
            debug,
        }
    }

    fn request(&self, invocation: &Invocation, argv: Vec<String>) -> SandboxRequest {
        let mut environment = self.environment.clone();
        environment.extend(invocation.environment.clone());
        SandboxRequest {
            environment,
            ..SandboxRequest::new(invocation.directives.clone(), argv)
        }
    }

    pub fn invoke(&self, invocation: &Invocation, sink: &mut (dyn Write + Send)) -> Result<ExecutionResult> {
        if self.debug {
            if let Some(diagnostic) = &invocation.diagnostic_argv {
                let request = self.request(invocation, diagnostic.clone());
                match self.sandbox.run(&request, sink) {
                    Ok(result) => debug!("diagnostic run exited with {}", result.exit_code),
                    Err(err) => debug!("diagnostic run failed: {:#}", err),
                }
            }
        }

        let request = self.request(invocation, invocation.argv.clone());
        info!("running {}", request.command_line());
        self.sandbox.run(&request, sink)
    }
}

fn pump(mut stream: impl Read, sink: &Mutex<&mut (dyn Write + Send)>) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        let mut sink = sink
            .lock()
            .map_err(|_| io::Error::other("output sink poisoned"))?;
        sink.write_all(&buf[..n])?;
        sink.flush()?;
    }
}

/// Forward a spawned child's piped stdout and stderr to `sink` as they are
/// produced, then wait for it.
pub(crate) fn forward_output(child: &mut Child, sink: &mut (dyn Write + Send)) -> Result<ExitStatus> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let sink = Mutex::new(sink);

    let forwarded = thread::scope(|s| -> Result<()> {
        let sink = &sink;
        let out = stdout.map(|stream| s.spawn(move || pump(stream, sink)));
        let err = stderr.map(|stream| s.spawn(move || pump(stream, sink)));
        for handle in [out, err].into_iter().flatten() {
            handle
                .join()
                .map_err(|_| anyhow!("output forwarding thread panicked"))??;
        }
        Ok(())
    });

    let status = child.wait()?;
    forwarded?;
    Ok(status)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records requests and answers with scripted exit codes.
    #[derive(Default)]
    pub struct RecordingSandbox {
        pub requests: Mutex<Vec<SandboxRequest>>,
        /// Exit code per argv[1]; 0 when absent.
        pub exit_codes: BTreeMap<String, i32>,
    }

    impl RecordingSandbox {
        pub fn failing(arg: &str, code: i32) -> Self {
            Self {
                exit_codes: BTreeMap::from([(arg.to_string(), code)]),
                ..Self::default()
            }
        }

        pub fn requests(&self) -> Vec<SandboxRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Sandbox for RecordingSandbox {
        fn run(&self, request: &SandboxRequest, sink: &mut (dyn Write + Send)) -> Result<ExecutionResult> {
            writeln!(sink, "{}", request.command_line())?;
            self.requests.lock().unwrap().push(request.clone());
            let exit_code = request
                .argv
                .get(1)
                .and_then(|arg| self.exit_codes.get(arg))
                .copied()
                .unwrap_or(0);
            Ok(ExecutionResult { exit_code })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSandbox;
    use super::*;
    use std::process::{Command, Stdio};

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_per_call_environment_wins() {
        let sandbox = RecordingSandbox::default();
        let invoker = Invoker::new(&sandbox, env(&[("FEATURES", "a"), ("HOME", "/root")]), false);
        let invocation = Invocation {
            argv: vec!["emerge".into(), "--sync".into()],
            environment: env(&[("HOME", "/var/lib/portage/home")]),
            ..Invocation::default()
        };

        invoker.invoke(&invocation, &mut io::sink()).unwrap();

        let request = &sandbox.requests()[0];
        assert_eq!(request.environment, env(&[("FEATURES", "a"), ("HOME", "/var/lib/portage/home")]));
        assert!(request.network && request.devices);
    }

    #[test]
    fn test_diagnostic_run_only_in_debug_mode() {
        let invocation = Invocation {
            argv: vec!["emerge".into(), "sys-apps/baselayout".into()],
            diagnostic_argv: Some(vec!["emerge".into(), "--info".into()]),
            ..Invocation::default()
        };

        let quiet = RecordingSandbox::default();
        Invoker::new(&quiet, BTreeMap::new(), false)
            .invoke(&invocation, &mut io::sink())
            .unwrap();
        assert_eq!(quiet.requests().len(), 1);

        let verbose = RecordingSandbox::failing("--info", 1);
        let mut out = Vec::new();
        let result = Invoker::new(&verbose, BTreeMap::new(), true)
            .invoke(&invocation, &mut out)
            .unwrap();
        assert!(result.success());
        let argvs: Vec<_> = verbose.requests().into_iter().map(|r| r.argv).collect();
        assert_eq!(argvs[0], vec!["emerge", "--info"]);
        assert_eq!(argvs[1], vec!["emerge", "sys-apps/baselayout"]);
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_non_zero_exit_is_returned_then_checked() {
        let sandbox = RecordingSandbox::failing("--oneshot", 3);
        let invoker = Invoker::new(&sandbox, BTreeMap::new(), false);
        let invocation = Invocation {
            argv: vec!["emerge".into(), "--oneshot".into()],
            ..Invocation::default()
        };

        let result = invoker.invoke(&invocation, &mut io::sink()).unwrap();
        assert_eq!(result.exit_code, 3);

        let err = result
            .check("install", &invocation.argv.join(" "))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<BackendError>(),
            Some(&BackendError::Invocation {
                operation: "install".into(),
                command: "emerge --oneshot".into(),
                exit_code: 3,
            })
        );
    }

    #[test]
    fn test_forward_output_collects_both_streams() {
        let mut child = Command::new("sh")
            .args(["-c", "echo out; echo err >&2; exit 4"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        let mut sink = Vec::new();
        let status = forward_output(&mut child, &mut sink).unwrap();

        assert_eq!(status.code(), Some(4));
        let text = String::from_utf8(sink).unwrap();
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
    }
}
