use clap::Parser;

use portward::cli::{Cli, Command};
use portward::config::Config;
use portward::hosts::HostsFile;
use portward::{logging, supervisor, AppError};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.debug);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        None => supervisor::run(&config, &cli.tags).await,
        Some(Command::List) => {
            for tunnel in config.ssh.resolve_all(&cli.tags)? {
                println!(
                    "{} -> {} via {}@{}",
                    tunnel.local_addr(),
                    tunnel.remote_addr(),
                    tunnel.ssh_user,
                    tunnel.ssh_addr()
                );
            }
            Ok(())
        }
        Some(Command::UpdateHosts) => {
            let tunnels = config.ssh.resolve_all(&cli.tags)?;
            HostsFile::system()
                .add_loopback_aliases(tunnels.iter().map(|t| t.local_host.as_str()))?;
            Ok(())
        }
        Some(Command::CleanHosts) => {
            let tunnels = config.ssh.resolve_all(&cli.tags)?;
            HostsFile::system()
                .remove_loopback_aliases(tunnels.iter().map(|t| t.local_host.as_str()))?;
            Ok(())
        }
    }
}
