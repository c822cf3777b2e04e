use std::path::PathBuf;

use clap::Parser;

use crate::errors::{InstanSegError, Result};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;
pub const MODEL_DIR_NAME: &str = "models";
pub const SAMPLE_DIR_NAME: &str = "sample_images";

/// Server configuration.
///
/// Every flag has a default, so running the binary without arguments binds
/// `0.0.0.0:8000` and looks for models and sample images next to the
/// executable.
#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory holding one `<model_name>.onnx` file per model variant
    #[arg(short, long)]
    pub model_dir: Option<PathBuf>,

    /// Directory of bundled sample images
    #[arg(short, long)]
    pub sample_dir: Option<PathBuf>,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from([env!("CARGO_PKG_NAME")])
    }
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn model_dir(&self) -> Result<PathBuf> {
        match &self.model_dir {
            Some(dir) => Ok(dir.clone()),
            None => exe_relative(MODEL_DIR_NAME),
        }
    }

    pub fn sample_dir(&self) -> Result<PathBuf> {
        match &self.sample_dir {
            Some(dir) => Ok(dir.clone()),
            None => exe_relative(SAMPLE_DIR_NAME),
        }
    }
}

/// Resolves `name` against the directory of the running executable.
fn exe_relative(name: &str) -> Result<PathBuf> {
    let exe = std::env::current_exe().map_err(|e| InstanSegError::FileSystem {
        path: PathBuf::from(name),
        operation: "locate executable".to_string(),
        source: e,
    })?;
    let dir = exe.parent().ok_or_else(|| InstanSegError::Configuration {
        message: format!("executable {} has no parent directory", exe.display()),
    })?;
    Ok(dir.join(name))
}
