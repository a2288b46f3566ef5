use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use waypoint_core::config::EngineConfig;

use super::OutputContext;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration (defaults, file, environment)
    Show,
    /// Check a configuration file without running anything
    Validate {
        /// File to check; defaults to --config
        file: Option<PathBuf>,
    },
    /// Write the default configuration to a file
    Init {
        /// Destination
        #[arg(default_value = "waypoint.toml")]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

pub fn execute(args: ConfigArgs, config_file: Option<&Path>, output: &OutputContext) -> Result<()> {
    match args.command {
        ConfigCommands::Show => show_config(config_file, output),
        ConfigCommands::Validate { file } => validate_config(file.as_deref().or(config_file), output),
        ConfigCommands::Init { path, force } => init_config(&path, force, output),
    }
}

fn show_config(config_file: Option<&Path>, output: &OutputContext) -> Result<()> {
    let cfg = EngineConfig::load(config_file)?;
    if output.json {
        return output.print_json(&cfg);
    }
    print!("{}", cfg.to_toml()?);
    Ok(())
}

fn validate_config(file: Option<&Path>, output: &OutputContext) -> Result<()> {
    let Some(path) = file else {
        output.print_error("No configuration file given");
        return Ok(());
    };
    match EngineConfig::from_file(path).and_then(|cfg| cfg.validate()) {
        Ok(()) => output.print_success(&format!("{} is valid", path.display())),
        Err(e) => output.print_error(&format!("{}: {e}", path.display())),
    }
    Ok(())
}

fn init_config(path: &Path, force: bool, output: &OutputContext) -> Result<()> {
    if path.exists() && !force {
        output.print_error(&format!(
            "Configuration file already exists at {}. Use --force to overwrite.",
            path.display()
        ));
        return Ok(());
    }
    let rendered = EngineConfig::default().to_toml()?;
    std::fs::write(path, rendered).with_context(|| format!("writing {}", path.display()))?;
    output.print_success(&format!("Configuration file created at {}", path.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> OutputContext {
        OutputContext {
            json: false,
            csv: false,
            verbose: false,
        }
    }

    #[test]
    fn test_init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waypoint.toml");
        init_config(&path, false, &quiet()).unwrap();
        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded, EngineConfig::default());
    }

    #[test]
    fn test_init_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waypoint.toml");
        std::fs::write(&path, "[table]\nnum_segments = 8\n").unwrap();
        init_config(&path, false, &quiet()).unwrap();
        assert_eq!(EngineConfig::from_file(&path).unwrap().table.num_segments, 8);
    }
}
