use std::path::PathBuf;

use crate::cli::{Cli, Command};
use crate::resume::{new_resume_log_path, resolve_latest_resume_log};
use crate::types::{ContainerInclude, ZipCompression};

#[derive(Debug, Clone)]
pub struct DepotRootConfig {
    pub path: PathBuf,
    pub max_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub command: CommandConfig,
    pub depot_roots: Vec<DepotRootConfig>,
    pub workers: usize,
    pub db: Option<PathBuf>,
    pub resume_path: Option<PathBuf>,
    pub resume_dir: PathBuf,
    pub skip_initial_scan: bool,
    pub only_needed: bool,
    pub zip_include: ContainerInclude,
    pub gzip_include: ContainerInclude,
    pub sevenz_include: ContainerInclude,
    pub zip_compression: ZipCompression,
    pub verbose: u8,
}

#[derive(Debug, Clone)]
pub enum CommandConfig {
    Archive { input: Vec<PathBuf> },
    PurgeBackup { backup_dir: PathBuf, from_dat: Option<String> },
    Build { output_dir: PathBuf, write_fixdats: bool },
    Dir2Dat { input: PathBuf, name: String, out: PathBuf },
    Diffdat { old: PathBuf, new: PathBuf, out: PathBuf, name: String },
    Ediffdat { old: PathBuf, new: PathBuf, out: PathBuf },
    Lookup { hash: String },
    RefreshDats { input: Vec<PathBuf> },
    Progress,
    Cancel,
    Shutdown,
    Memstats,
    Dbstats,
}

const DEFAULT_ROOT_BYTES: u64 = 400 * 1024 * 1024 * 1024;

impl Config {
    fn validate_depot_roots(&self) -> anyhow::Result<()> {
        let needs_depot = matches!(
            self.command,
            CommandConfig::Archive { .. }
                | CommandConfig::PurgeBackup { .. }
                | CommandConfig::Build { .. }
        );
        if needs_depot && self.depot_roots.is_empty() {
            anyhow::bail!("at least one --depot-root is required for this command");
        }
        Ok(())
    }

    fn validate_workers(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("--workers must be >= 1");
        }
        Ok(())
    }

    fn validate_command_inputs(&self) -> anyhow::Result<()> {
        match &self.command {
            CommandConfig::Archive { input } if input.is_empty() => {
                anyhow::bail!("archive requires at least one input path")
            }
            CommandConfig::RefreshDats { input } if input.is_empty() => {
                anyhow::bail!("refresh-dats requires at least one input path")
            }
            _ => Ok(()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_depot_roots()?;
        self.validate_workers()?;
        self.validate_command_inputs()?;
        Ok(())
    }

    /// Resolves `--resume latest` against `resume_dir`, falling back to a
    /// freshly named log when no prior run exists.
    pub fn resolve_resume_log(&self, kind: &str, timestamp: &str) -> anyhow::Result<PathBuf> {
        match &self.resume_path {
            Some(path) if path.to_string_lossy() == "latest" => {
                Ok(resolve_latest_resume_log(&self.resume_dir, kind)?
                    .unwrap_or_else(|| new_resume_log_path(&self.resume_dir, kind, timestamp)))
            }
            Some(path) => Ok(path.clone()),
            None => Ok(new_resume_log_path(&self.resume_dir, kind, timestamp)),
        }
    }
}

fn parse_depot_root(spec: &str) -> DepotRootConfig {
    match spec.split_once(':') {
        Some((path, bytes)) => DepotRootConfig {
            path: PathBuf::from(path),
            max_bytes: bytes.parse().unwrap_or(DEFAULT_ROOT_BYTES),
        },
        None => DepotRootConfig {
            path: PathBuf::from(spec),
            max_bytes: DEFAULT_ROOT_BYTES,
        },
    }
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let command = match cli.command {
            Command::Archive { input } | Command::Merge { input } => CommandConfig::Archive { input },
            Command::PurgeBackup { backup_dir, from_dat } => {
                CommandConfig::PurgeBackup { backup_dir, from_dat }
            }
            Command::Build { output_dir } => CommandConfig::Build {
                output_dir,
                write_fixdats: false,
            },
            Command::Fixdat { output_dir } => CommandConfig::Build {
                output_dir,
                write_fixdats: true,
            },
            Command::Dir2Dat { input, name, out } => CommandConfig::Dir2Dat { input, name, out },
            Command::Diffdat { old, new, out, name } => CommandConfig::Diffdat { old, new, out, name },
            Command::Ediffdat { old, new, out } => CommandConfig::Ediffdat { old, new, out },
            Command::Lookup { hash } => CommandConfig::Lookup { hash },
            Command::RefreshDats { input } => CommandConfig::RefreshDats { input },
            Command::Progress => CommandConfig::Progress,
            Command::Cancel => CommandConfig::Cancel,
            Command::Shutdown => CommandConfig::Shutdown,
            Command::Memstats => CommandConfig::Memstats,
            Command::Dbstats => CommandConfig::Dbstats,
        };

        let config = Self {
            command,
            depot_roots: cli.depot_root.iter().map(|s| parse_depot_root(s)).collect(),
            workers: cli.workers.unwrap_or_else(num_cpus::get),
            db: cli.db,
            resume_path: cli.resume.map(PathBuf::from),
            resume_dir: cli.resume_dir.unwrap_or_else(|| PathBuf::from(".")),
            skip_initial_scan: cli.skip_initial_scan,
            only_needed: cli.only_needed,
            zip_include: cli.zip_include,
            gzip_include: cli.gzip_include,
            sevenz_include: cli.sevenz_include,
            zip_compression: cli.zip_compression,
            verbose: cli.verbose,
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn archive_without_depot_root_fails_validation() {
        let cli = Cli::try_parse_from(["romdepot", "archive", "input"]).unwrap();
        let result = Config::try_from(cli);
        assert!(result.is_err());
    }

    #[test]
    fn archive_with_depot_root_and_input_succeeds() {
        let cli = Cli::try_parse_from([
            "romdepot",
            "--depot-root",
            "/tmp/root0:1000",
            "archive",
            "input",
        ])
        .unwrap();
        let config = Config::try_from(cli).unwrap();
        assert_eq!(config.depot_roots[0].max_bytes, 1000);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let cli = Cli::try_parse_from([
            "romdepot",
            "--depot-root",
            "/tmp/root0",
            "--workers",
            "0",
            "archive",
            "input",
        ])
        .unwrap();
        assert!(Config::try_from(cli).is_err());
    }
}
