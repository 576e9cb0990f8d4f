//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// portward - SSH local port-forwarding tunnels from a static config.
#[derive(Debug, Parser)]
#[command(
    name = "portward",
    version,
    about = "Run a set of SSH local port-forwarding tunnels from a YAML config"
)]
pub struct Cli {
    /// Config file (default is ~/.portward.yaml)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short = 'd', long = "debug", global = true)]
    pub debug: bool,

    /// Only act on tunnels carrying this tag (repeatable; all tags must match)
    #[arg(short = 't', long = "tag", value_name = "TAG", global = true)]
    pub tags: Vec<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the configured tunnels
    List,
    /// Add loopback aliases for every tunnel's local host to the hosts file
    UpdateHosts,
    /// Remove the loopback aliases again
    CleanHosts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::parse_from(["portward"]);
        assert!(cli.command.is_none());
        assert!(!cli.debug);
        assert!(cli.tags.is_empty());
    }

    #[test]
    fn parses_tags_and_config() {
        let cli = Cli::parse_from([
            "portward", "-t", "db", "--tag", "prod", "-c", "/tmp/pw.yaml", "-d",
        ]);
        assert_eq!(cli.tags, vec!["db", "prod"]);
        assert_eq!(cli.config.unwrap(), PathBuf::from("/tmp/pw.yaml"));
        assert!(cli.debug);
    }

    #[test]
    fn parses_subcommands() {
        let cli = Cli::parse_from(["portward", "list"]);
        assert!(matches!(cli.command, Some(Command::List)));

        let cli = Cli::parse_from(["portward", "clean-hosts"]);
        assert!(matches!(cli.command, Some(Command::CleanHosts)));
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::parse_from(["portward", "update-hosts", "-c", "/tmp/pw.yaml"]);
        assert!(matches!(cli.command, Some(Command::UpdateHosts)));
        assert_eq!(cli.config.unwrap(), PathBuf::from("/tmp/pw.yaml"));
    }
}
