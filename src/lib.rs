//! Sandboxed package manager backend for source-based distributions.
//!
//! The backend bootstraps a build from a published base-system snapshot
//! (a Gentoo stage3), then runs the distribution's own package manager from
//! that snapshot inside a bubblewrap sandbox, installing into a separate
//! install root.
//!
//! # Architecture
//!
//! ```text
//! Pipeline
//!     │
//!     ├── DistributionInstaller (gentoo)   arch names, base packages, kernel links
//!     │
//!     └── PackageManagerBackend (emerge)
//!             ├── stage3::resolver   latest snapshot from the mirror index
//!             ├── stage3::cache      locked single-slot download + extraction
//!             ├── mounts             sandbox view of stage3 + install root
//!             └── sandbox            bwrap rendering and invocation
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use distro_pkgmgr::{BuildConfig, BuildContext, Pipeline, Services};
//!
//! let config = BuildConfig::load(Path::new("build.toml"))?;
//! let services = Services::from_config(&config);
//! let ctx = BuildContext::new(config, Path::new("/var/tmp/build"))?;
//!
//! let mut pipeline = Pipeline::new(ctx, services);
//! pipeline.run_all(&["app-editors/vim".to_string()])?;
//! ```

pub mod arch;
pub mod backend;
pub mod build;
pub mod config;
pub mod distribution;
pub mod error;
pub mod logging;
pub mod mounts;
pub mod net;
pub mod pipeline;
pub mod sandbox;
pub mod stage3;

pub use arch::Architecture;
pub use backend::{BackendConfig, Emerge, PackageManagerBackend, Services};
pub use build::context::BuildContext;
pub use config::BuildConfig;
pub use distribution::{installer, Distribution, DistributionInstaller};
pub use error::BackendError;
pub use mounts::{ConfigPolicy, MountDirective};
pub use pipeline::Pipeline;
pub use sandbox::{BwrapSandbox, ExecutionResult, Sandbox, SandboxRequest};
pub use stage3::SnapshotRef;
