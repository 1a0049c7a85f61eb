use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::error::Error;
use crate::pack::{DEFAULT_CHUNK_SIZE, DEFAULT_COMPRESSION_LEVEL};
use crate::pipeline::{UploadOptions, DEFAULT_MAX_UPLOAD_SIZE};

#[derive(Parser)]
#[command(name = "Onionbox")]
#[command(about = "Share files from memory behind a short lived, unguessable handle")]
#[command(author, version, long_about = None)]
pub struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Debug logging, overrides RUST_LOG
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Packages files into the in-memory store and serves them on stdin
    Share {
        /// Files to share
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Encrypt the package with this password
        #[arg(short, long)]
        password: Option<String>,

        /// Expire the package after this long, eg 10m or 1h30m
        #[arg(short, long)]
        expire: Option<String>,

        /// Destroy the package after this many downloads, 0 is unlimited
        #[arg(short, long)]
        limit: Option<String>,
    },

    /// Extracts a downloaded package
    Unpack {
        /// The package to extract
        archive: PathBuf,

        /// Directory to extract into
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Password the package was encrypted with
        #[arg(short, long)]
        password: Option<String>,
    },
}

// Configuration
#[derive(Deserialize, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub chunk_size: usize,
    pub max_upload_size: u64,
    pub reap_interval_secs: u64,
    pub compression_level: i32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            reap_interval_secs: 1,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Config, Error> {
        match path {
            Some(path) => Config::parse(&std::fs::read_to_string(path)?),
            None => Ok(Config::default()),
        }
    }

    pub fn parse(content: &str) -> Result<Config, Error> {
        let config: Config = toml::from_str(content)?;

        if config.reap_interval_secs == 0 {
            return Err(Error::parse("reap_interval_secs", "0"));
        }
        Ok(config)
    }

    pub fn reap_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reap_interval_secs)
    }

    pub fn upload_options(&self) -> UploadOptions {
        UploadOptions {
            chunk_size: self.chunk_size,
            max_upload_size: self.max_upload_size,
            compression_level: self.compression_level,
            ..UploadOptions::default()
        }
    }
}
