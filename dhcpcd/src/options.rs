//! Daemon options shared by all processes.

use crate::{error::Error, privsep::Role};
use serde_derive::{Deserialize, Serialize};
use std::{env, path::PathBuf};

/// Default directory for control sockets and the pid file.
pub const RUNDIR: &str = "/var/run/dhcpcd";

/// Default directory for leases and other persistent state.
pub const DBDIR: &str = "/var/db/dhcpcd";

/// Default privdrop user.
pub const USERNAME: &str = Role::USERNAME;

/// General options for the daemon and its privsep setup.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Options {
    /// Split the daemon into privilege-separated processes.
    pub privsep: bool,
    /// This stops requiring root and disables privdrop.
    pub disable_privdrop: bool,
    /// The privdrop username, if enabled.
    pub username: String,
    /// Log to stderr instead of syslog.
    pub foreground: bool,
    /// Runtime directory.
    pub rundir: PathBuf,
    /// Database directory.
    pub dbdir: PathBuf,
    /// The only hook script that the root process will run.
    pub script: Option<PathBuf>,
    /// Interfaces to manage, all of them if empty.
    pub interfaces: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            privsep: true,
            disable_privdrop: false,
            username: USERNAME.to_string(),
            foreground: false,
            rundir: RUNDIR.into(),
            dbdir: DBDIR.into(),
            script: None,
            interfaces: vec![],
        }
    }
}

impl Options {
    /// Returns the default options with `DHCPCD_*` environment overrides.
    pub fn from_env() -> Result<Self, Error> {
        let mut options = Self::default();

        if let Some(value) = var("DHCPCD_NO_PRIVSEP")? {
            options.privsep = !flag(&value);
        }
        if let Some(value) = var("DHCPCD_NO_PRIVDROP")? {
            options.disable_privdrop = flag(&value);
        }
        if let Some(value) = var("DHCPCD_FOREGROUND")? {
            options.foreground = flag(&value);
        }
        if let Some(value) = var("DHCPCD_USER")? {
            options.username = value;
        }
        if let Some(value) = var("DHCPCD_RUNDIR")? {
            options.rundir = value.into();
        }
        if let Some(value) = var("DHCPCD_DBDIR")? {
            options.dbdir = value.into();
        }
        if let Some(value) = var("DHCPCD_SCRIPT")? {
            options.script = Some(value.into());
        }
        if let Some(value) = var("DHCPCD_INTERFACES")? {
            options.interfaces = value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(ToString::to_string)
                .collect();
        }

        Ok(options)
    }
}

fn var(key: &str) -> Result<Option<String>, Error> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn flag(value: &str) -> bool {
    matches!(value, "1" | "yes" | "true" | "on")
}
