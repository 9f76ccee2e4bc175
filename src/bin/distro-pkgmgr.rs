use std::path::Path;

use anyhow::{bail, Context, Result};
use distro_pkgmgr::{logging, BuildConfig, BuildContext, Pipeline, Services};

fn usage() -> &'static str {
    "Usage:\n  distro-pkgmgr run <config.toml> <workspace> [package...]\n  distro-pkgmgr setup <config.toml> <workspace>\n  distro-pkgmgr sync <config.toml> <workspace>\n  distro-pkgmgr install <config.toml> <workspace> <package>...\n  distro-pkgmgr upgrade <config.toml> <workspace> [package...]\n  distro-pkgmgr remove <config.toml> <workspace> <package>...\n  distro-pkgmgr createrepo <config.toml> <workspace>"
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [command, config, workspace, packages @ ..] => {
            let mut pipeline = open(Path::new(config), Path::new(workspace))?;
            dispatch(&mut pipeline, command, packages)
        }
        _ => bail!(usage()),
    }
}

fn open(config_path: &Path, workspace: &Path) -> Result<Pipeline> {
    let config = BuildConfig::load(config_path)?;
    logging::init(config.debug);

    let services = Services::from_config(&config);
    let ctx = BuildContext::new(config, workspace)
        .with_context(|| format!("preparing workspace '{}'", workspace.display()))?;
    Ok(Pipeline::new(ctx, services))
}

fn dispatch(pipeline: &mut Pipeline, command: &str, packages: &[String]) -> Result<()> {
    match command {
        "run" => pipeline.run_all(packages),
        "setup" => pipeline.setup(),
        "sync" => {
            pipeline.setup()?;
            pipeline.sync()
        }
        "install" if !packages.is_empty() => {
            pipeline.setup()?;
            pipeline.install_packages(packages)
        }
        "upgrade" => {
            pipeline.setup()?;
            pipeline.upgrade(packages)
        }
        "remove" if !packages.is_empty() => {
            pipeline.setup()?;
            pipeline.remove(packages)
        }
        "createrepo" => {
            pipeline.setup()?;
            pipeline.createrepo()
        }
        _ => bail!(usage()),
    }
}
