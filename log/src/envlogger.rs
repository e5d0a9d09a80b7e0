//! `RUST_LOG` style filtering.
//!
//! Directives are separated by commas and have the form
//! `[process@][module=]level`.  The level is one of `off`, `critical`,
//! `error`, `warn`, `info`, `debug` or `trace`.  A module matches
//! itself and its submodules; a process name limits the directive to
//! the process that was started with that name, so
//! `info,inet@dhcpcd::net=debug` only raises the level of the network
//! code in the `inet` process.  The last matching directive wins.

use slog::{Drain, Level, OwnedKVList, Record};
use std::{env, str::FromStr};

#[derive(Debug, PartialEq)]
struct Directive {
    module: Option<String>,
    /// `None` disables logging.
    level: Option<Level>,
}

impl Directive {
    /// Parse a directive, `None` if it is invalid or for another process.
    fn parse(directive: &str, process: &str) -> Option<Self> {
        let directive = directive.trim();
        let directive = match directive.split_once('@') {
            Some((name, rest)) if name == process => rest,
            Some(_) => return None,
            None => directive,
        };
        let (module, level) = match directive.split_once('=') {
            Some((module, level)) if is_path(module) => (Some(module.to_string()), level),
            Some(_) => return None,
            None => (None, directive),
        };
        let level = if level.eq_ignore_ascii_case("off") {
            None
        } else {
            Some(Level::from_str(level).ok()?)
        };

        Some(Self { module, level })
    }

    fn matches(&self, module: &str) -> bool {
        match &self.module {
            None => true,
            Some(prefix) => module
                .strip_prefix(prefix.as_str())
                .map_or(false, |rest| rest.is_empty() || rest.starts_with("::")),
        }
    }
}

fn is_path(module: &str) -> bool {
    !module.is_empty()
        && module
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

#[derive(Debug)]
struct Directives(Vec<Directive>);

impl Directives {
    /// Invalid directives are ignored.
    fn parse(filter: &str, process: &str) -> Self {
        Self(
            filter
                .split(',')
                .filter_map(|directive| Directive::parse(directive, process))
                .collect(),
        )
    }

    fn is_enabled(&self, module: &str, level: Level) -> bool {
        self.0
            .iter()
            .rev()
            .find(|directive| directive.matches(module))
            .and_then(|directive| directive.level)
            .map_or(false, |max| level.is_at_least(max))
    }
}

/// Drain that applies the `RUST_LOG` directives of one process.
pub struct Logger<T: Drain> {
    drain: T,
    directives: Directives,
}

impl<T: Drain> Logger<T> {
    pub fn new(drain: T, process: &str) -> Self {
        let filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        Self::with_filter(drain, process, &filter)
    }

    pub fn with_filter(drain: T, process: &str, filter: &str) -> Self {
        Self {
            drain,
            directives: Directives::parse(filter, process),
        }
    }
}

impl<T> Drain for Logger<T>
where
    T: Drain<Ok = ()>,
{
    type Err = T::Err;
    type Ok = ();

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<(), T::Err> {
        if self.directives.is_enabled(record.module(), record.level()) {
            self.drain.log(record, values)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Directive, Directives};
    use slog::Level;

    #[test]
    fn test_directives() {
        let directives = Directives::parse("warn,dhcpcd::arp=debug", "manager");

        assert!(directives.is_enabled("dhcpcd::eloop", Level::Error));
        assert!(!directives.is_enabled("dhcpcd::eloop", Level::Info));
        assert!(directives.is_enabled("dhcpcd::arp", Level::Debug));
        assert!(directives.is_enabled("dhcpcd::arp::link", Level::Debug));
        assert!(!directives.is_enabled("dhcpcd::arp", Level::Trace));
        assert!(!directives.is_enabled("dhcpcd::arpx", Level::Debug));
    }

    #[test]
    fn test_process_directives() {
        let filter = "info,inet@dhcpcd::net=trace,control@off";

        let inet = Directives::parse(filter, "inet");
        assert!(inet.is_enabled("dhcpcd::net::packet", Level::Trace));
        assert!(!inet.is_enabled("dhcpcd::eloop", Level::Debug));

        let control = Directives::parse(filter, "control");
        assert!(!control.is_enabled("dhcpcd::control", Level::Critical));

        let root = Directives::parse(filter, "root");
        assert!(!root.is_enabled("dhcpcd::net", Level::Debug));
        assert!(root.is_enabled("dhcpcd::net", Level::Info));
    }

    #[test]
    fn test_invalid_directives() {
        assert_eq!(Directive::parse("bogus", "root"), None);
        assert_eq!(Directive::parse("a=b=c", "root"), None);
        assert_eq!(Directive::parse("=debug", "root"), None);

        let directives = Directives::parse("bogus,a=b=c", "root");
        assert!(!directives.is_enabled("dhcpcd", Level::Critical));
    }
}
