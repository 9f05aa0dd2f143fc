// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Configuration gathered from multiple sources.
//!
//! A configuration is a struct whose fields are all `Option`s. It derives
//! [`clap::Parser`], [`serde::Serialize`] and [`serde::Deserialize`] and
//! implements [`MultiSourceConfig`]. Values are then merged in the following
//! order, later sources overriding earlier ones:
//!
//!  1. the struct's [`Default`] implementation,
//!  2. an optional static TOML configuration file
//!     ([`MultiSourceConfig::static_conf_file`]),
//!  3. an optional extra TOML file chosen at run time,
//!  4. environment variables prefixed with [`ENV_PREFIX`], so the field
//!     `world_size` is set by `LOCKSTEP_WORLD_SIZE`,
//!  5. values given explicitly on the command line.
//!
//! ```rust
//! use clap::Parser;
//! use lockstep_config::MultiSourceConfig;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Parser, Serialize, Deserialize, Clone, Debug)]
//! struct Settings {
//!     /// Number of worker processes
//!     #[arg(long)]
//!     world_size: Option<usize>,
//! }
//!
//! impl Default for Settings {
//!     fn default() -> Self {
//!         Self { world_size: Some(4) }
//!     }
//! }
//!
//! impl MultiSourceConfig for Settings {
//!     fn overlay(&mut self, other: Self) {
//!         if other.world_size.is_some() {
//!             self.world_size = other.world_size;
//!         }
//!     }
//! }
//!
//! let settings = Settings::parse_sources_from(["sim", "--world-size", "2"]).unwrap();
//! assert_eq!(settings.world_size, Some(2));
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Prefix of the environment variables that configure a run.
pub const ENV_PREFIX: &str = "LOCKSTEP_";

/// Errors reported while building a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid command line: {0}")]
    Cli(#[from] clap::Error),

    #[error("invalid configuration: {0}")]
    Figment(#[from] figment::Error),

    #[error("{} is not a file path", .0.display())]
    NotAFile(PathBuf),

    #[error("{} not found", .0.display())]
    NotFound(PathBuf),
}

/// A configuration that can be assembled from every supported source.
pub trait MultiSourceConfig:
    Parser + Serialize + DeserializeOwned + Default + Clone
{
    /// Replace the fields of `self` with every field that is set in `other`.
    fn overlay(&mut self, other: Self);

    /// A TOML file that is always read when it exists.
    fn static_conf_file() -> Option<PathBuf> {
        None
    }

    /// A [`Figment`] holding only the default values.
    fn figment_with_defaults() -> Figment {
        Figment::new().merge(Serialized::defaults(Self::default()))
    }

    /// Merge defaults, configuration files and environment variables.
    fn figment_to_config(extra_conf_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Self::figment_with_defaults();
        if let Some(conf_file) = Self::static_conf_file() {
            figment = figment.merge(Toml::file(conf_file));
        }
        if let Some(conf_file) = extra_conf_file {
            figment = figment.merge(Toml::file(conf_file));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));
        Ok(figment.extract()?)
    }

    /// Build the configuration with `cli` holding the command-line values.
    fn from_sources(extra_conf_file: Option<&Path>, cli: Self) -> Result<Self, ConfigError> {
        let mut config = Self::figment_to_config(extra_conf_file)?;
        config.overlay(cli);
        Ok(config)
    }

    /// Build the configuration, parsing the command line from `args`.
    fn parse_sources_from<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = Self::try_parse_from(args)?;
        Self::from_sources(None, cli)
    }

    /// Build the configuration from the process' own command line.
    fn parse_all_sources() -> Result<Self, ConfigError> {
        Self::parse_sources_from(std::env::args_os())
    }

    /// Rebuild `self` with an extra configuration file inserted before the
    /// environment variables and command-line values in `cli`.
    ///
    /// An empty path leaves `self` unchanged.
    fn parse_extra_conf_file(&mut self, conf_file: &Path, cli: Self) -> Result<(), ConfigError> {
        if conf_file.as_os_str().is_empty() {
            return Ok(());
        }
        if conf_file.is_dir() {
            return Err(ConfigError::NotAFile(conf_file.to_path_buf()));
        }
        if !conf_file.exists() {
            return Err(ConfigError::NotFound(conf_file.to_path_buf()));
        }

        *self = Self::from_sources(Some(conf_file), cli)?;
        Ok(())
    }
}
