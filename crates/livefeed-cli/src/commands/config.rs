//! `livefeed config` subcommands

use std::path::Path;

use anyhow::{bail, Result};
use clap::Subcommand;

use crate::config::Config;

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path
    Path,
}

pub fn run(command: ConfigCommands, path: &Path) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = Config::load_from(path)?;
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save_to(path)?;
            println!("Wrote {}", path.display());
        }
        ConfigCommands::Path => println!("{}", path.display()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_refuses_to_overwrite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");

        run(ConfigCommands::Init { force: false }, &path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), Config::default());

        assert!(run(ConfigCommands::Init { force: false }, &path).is_err());
        run(ConfigCommands::Init { force: true }, &path).unwrap();
    }
}
