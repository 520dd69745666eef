//! Runtime configuration for propagation: series tolerance and the executor
//! used for batched calls.
//!
//! Configurations are read from TOML documents of the form
//! ```toml
//! tolerance = 1e-12 # optional; default 2^-53
//! threads = 4       # optional; 0 = all cores (default), 1 = inline
//! ```

use std::path::Path;
use serde::Deserialize;
use crate::{
    action::Tolerance,
    error::{ ExpmError, ExpmResult },
    executor::{ Executor, Inline, ThreadPool },
};

/// Number of workers used for batched calls.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "usize")]
pub enum Threads {
    /// One worker per available core.
    #[default]
    Auto,
    /// Everything on the calling thread.
    Inline,
    /// A fixed number of workers.
    Fixed(usize),
}

impl From<usize> for Threads {
    fn from(n: usize) -> Self {
        match n {
            0 => Self::Auto,
            1 => Self::Inline,
            n => Self::Fixed(n),
        }
    }
}

/// Propagation settings.
#[derive(Copy, Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PropagatorConfig {
    pub tolerance: Tolerance,
    pub threads: Threads,
}

impl PropagatorConfig {
    /// Parse a TOML document.
    ///
    /// Both keys are optional; any other key is an error.
    pub fn from_toml_str(s: &str) -> ExpmResult<Self> {
        toml::from_str(s)
            .map_err(|e: toml::de::Error| ExpmError::Config(e.message().to_string()))
    }

    /// Read and parse a TOML file.
    pub fn from_file<P>(path: P) -> ExpmResult<Self>
    where P: AsRef<Path>
    {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| ExpmError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&s)
    }

    /// Build the executor described by `self.threads`.
    pub fn executor(&self) -> ExpmResult<Executor> {
        match self.threads {
            Threads::Inline => Ok(Executor::Inline(Inline)),
            Threads::Auto => ThreadPool::new(0).map(Executor::Pool),
            Threads::Fixed(n) => ThreadPool::new(n).map(Executor::Pool),
        }
    }
}
