//! Log output for the driver binary.

use tracing_subscriber::EnvFilter;

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "distro_pkgmgr=debug"
    } else {
        "distro_pkgmgr=info"
    }
}

/// Install a stderr subscriber. `RUST_LOG` wins over `debug` when set.
///
/// Calling this more than once is harmless; only the first call installs.
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .try_init();
}
