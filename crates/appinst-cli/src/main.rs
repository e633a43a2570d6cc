use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod dispatch;

#[derive(Parser, Debug)]
#[command(name = "appinst")]
#[command(about = "Application package installer with crash recovery", long_about = None)]
#[command(version)]
struct Cli {
    /// Installer config file. Defaults to `<root>/config.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Target user. Defaults to the calling user.
    #[arg(long, global = true)]
    uid: Option<u32>,
    /// Operate on the global (all users) scope.
    #[arg(long, global = true)]
    global: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install a package, or update it when already installed.
    Install {
        path: PathBuf,
        #[arg(long)]
        tep: Option<PathBuf>,
    },
    /// Reinstall an installed package from a package directory or archive.
    Reinstall { path: PathBuf },
    Uninstall { pkgid: String },
    /// Wipe the user data of an installed package.
    Clear { pkgid: String },
    /// Replay a recovery file, or every file left in the recovery dir.
    Recover { file: Option<PathBuf> },
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(dispatch::run_cli(cli));
}

#[cfg(test)]
mod tests;
