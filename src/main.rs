//! vbox-snapshotter CLI - Take rotating snapshots of a VirtualBox machine

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use vbox_snapshotter::backend::{VBoxManageBackend, VBoxManageConfig};
use vbox_snapshotter::{output, Config, Result, Snapshotter};

#[derive(Parser, Debug)]
#[command(name = "vbox-snapshotter")]
#[command(about = "Take a snapshot of a VirtualBox machine and prune old ones", long_about = None)]
#[command(version)]
struct Cli {
    /// Name or UUID of the machine to snapshot
    machine: String,

    /// JSON configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the VBoxManage executable
    #[arg(long, value_name = "PATH", env = "VBOXMANAGE")]
    vboxmanage: Option<PathBuf>,
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(path) = cli.vboxmanage {
        config.vboxmanage = path;
        config.validate()?;
    }

    let backend = VBoxManageBackend::with_config(VBoxManageConfig {
        executable: config.vboxmanage.clone(),
    });

    output::info("Starting auto snapshotter...");
    let summary = Snapshotter::from_config(&backend, &config).run(&cli.machine)?;
    tracing::info!(
        machine = %summary.machine,
        was_running = summary.was_running,
        pruned = summary.prune.deleted().len(),
        prune_failed = summary.prune.is_failed(),
        "run complete"
    );

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // missing or non UTF-8 machine names are rejected here with a usage error
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn machine_name_is_required() {
        let err = Cli::try_parse_from(["vbox-snapshotter"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn parses_machine_and_overrides() {
        let cli = Cli::try_parse_from([
            "vbox-snapshotter",
            "build-box",
            "--vboxmanage",
            "/opt/VBoxManage",
        ])
        .unwrap();
        assert_eq!(cli.machine, "build-box");
        assert_eq!(cli.vboxmanage, Some(PathBuf::from("/opt/VBoxManage")));
        assert!(cli.config.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_machine_name_is_rejected() {
        use std::ffi::OsString;
        use std::os::unix::ffi::OsStringExt;

        let name = OsString::from_vec(vec![0x66, 0x6f, 0xff]);
        let err = Cli::try_parse_from([OsString::from("vbox-snapshotter"), name]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUtf8);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
