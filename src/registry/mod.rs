//! Network mode registry.
//!
//! A [`CniManager`] is built once per invocation, holds the drivers keyed by
//! mode name together with the parameters of the operation being run, and is
//! passed down the dispatch chain explicitly.

use std::collections::HashMap;
use std::io::Write;
use tracing::{error, info};

use crate::config::NetConf;
use crate::error::{CniError, Result};
use crate::types::{CmdArgs, Result as CniResult};

/// A network mode implementation
pub trait CniDriver {
    /// Mode name this driver answers to
    fn mode(&self) -> &str;

    fn bootstrap(&self, args: &CmdArgs, conf: &NetConf) -> Result<CniResult>;

    fn unmount(&self, args: &CmdArgs, conf: &NetConf) -> Result<()>;

    fn check(&self, args: &CmdArgs, conf: &NetConf) -> Result<()>;
}

/// Parameters of one operation
#[derive(Debug, Clone)]
struct Operation {
    mode: String,
    args: CmdArgs,
    config: NetConf,
}

#[derive(Default)]
pub struct CniManager {
    drivers: HashMap<String, Box<dyn CniDriver>>,
    bootstrap: Option<Operation>,
    unmount: Option<Operation>,
    check: Option<Operation>,
    result: Option<CniResult>,
}

impl CniManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its own mode name. A mode can only be claimed once.
    pub fn register(&mut self, driver: Box<dyn CniDriver>) -> Result<()> {
        let mode = driver.mode().to_string();
        if mode.is_empty() {
            return Err(CniError::Internal("cni mode cannot be empty".to_string()));
        }
        if self.drivers.contains_key(&mode) {
            return Err(CniError::Internal(format!(
                "a driver for mode {mode} is already registered"
            )));
        }
        info!(mode = %mode, "registered network mode");
        self.drivers.insert(mode, driver);
        Ok(())
    }

    pub fn modes(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }

    pub fn set_bootstrap(&mut self, mode: &str, args: CmdArgs, config: NetConf) -> &mut Self {
        self.bootstrap = Some(Operation {
            mode: mode.to_string(),
            args,
            config,
        });
        self
    }

    pub fn set_unmount(&mut self, mode: &str, args: CmdArgs, config: NetConf) -> &mut Self {
        self.unmount = Some(Operation {
            mode: mode.to_string(),
            args,
            config,
        });
        self
    }

    pub fn set_check(&mut self, mode: &str, args: CmdArgs, config: NetConf) -> &mut Self {
        self.check = Some(Operation {
            mode: mode.to_string(),
            args,
            config,
        });
        self
    }

    fn resolve<'a>(
        &'a self,
        operation: &'a Option<Operation>,
        what: &str,
    ) -> Result<(&'a dyn CniDriver, &'a Operation)> {
        let operation = operation
            .as_ref()
            .filter(|op| !op.mode.is_empty())
            .ok_or_else(|| {
                CniError::Internal(format!("{what} needs mode, args and config to be set"))
            })?;
        let driver = self.drivers.get(&operation.mode).ok_or_else(|| {
            CniError::Config(format!(
                "no driver registered for mode {:?}, cannot {what}",
                operation.mode
            ))
        })?;
        Ok((driver.as_ref(), operation))
    }

    pub fn bootstrap_cni(&mut self) -> Result<()> {
        let (driver, op) = self.resolve(&self.bootstrap, "bootstrap")?;
        let result = driver.bootstrap(&op.args, &op.config).map_err(|err| {
            error!("bootstrap in mode {} failed: {}", op.mode, err);
            err
        })?;
        self.result = Some(result);
        Ok(())
    }

    pub fn unmount_cni(&self) -> Result<()> {
        let (driver, op) = self.resolve(&self.unmount, "unmount")?;
        driver.unmount(&op.args, &op.config)
    }

    pub fn check_cni(&self) -> Result<()> {
        let (driver, op) = self.resolve(&self.check, "check")?;
        driver.check(&op.args, &op.config)
    }

    pub fn result(&self) -> Option<&CniResult> {
        self.result.as_ref()
    }

    /// Write the captured bootstrap result at the configured version.
    pub fn print_result(&self, out: &mut dyn Write) -> Result<()> {
        let result = self
            .result
            .as_ref()
            .ok_or_else(|| CniError::Internal("no bootstrap result to print".to_string()))?;
        let version = self
            .bootstrap
            .as_ref()
            .map(|op| op.config.cni_version.as_str())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                CniError::Internal("bootstrap configuration carries no cniVersion".to_string())
            })?;
        result.print_as(version, out)
    }
}
