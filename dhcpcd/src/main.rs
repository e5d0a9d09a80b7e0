use dhcpcd::{
    manager::{run_manager, run_standalone},
    options::Options,
    privsep::{run_control, run_inet, run_root, Child, Role},
    Error,
};
use log::error;
use nix::sys::signal::{signal, SigHandler, Signal};
use std::{env, path::Path, process};

/// Role of this process, taken from the program name.
fn role() -> Option<Role> {
    env::args_os()
        .next()
        .as_ref()
        .and_then(|arg0| Path::new(arg0).file_name())
        .and_then(|name| name.to_str())
        .and_then(Role::from_name)
        .filter(|role| *role != Role::Root)
}

fn run_child(child: Child) -> Result<i32, Error> {
    match child.role {
        Role::Manager => run_manager(child),
        Role::Inet => run_inet(child),
        Role::Control => run_control(child),
        Role::Root => Err(Error::InvalidProcess),
    }
}

fn main() {
    let role = role();
    let name = role.unwrap_or(Role::Root).name();

    // Children get their options from the start message.
    let (options, child) = match role {
        None => (Options::from_env(), None),
        Some(role) => match Child::new(role) {
            Ok(child) => (Ok(child.options.clone()), Some(child)),
            Err(err) => (Err(err), None),
        },
    };
    let options = match options {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{}: {}", name, err);
            process::exit(1);
        }
    };

    let guard = match dhcpcd_log::async_logger(name, options.foreground) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("{}: failed to initialize logging: {}", name, err);
            process::exit(1);
        }
    };

    // Closed clients and channels are handled as write errors.
    if let Err(err) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
        error!("{}: {}", name, err);
    }

    let result = match child {
        Some(child) => run_child(child),
        None if options.privsep => run_root(options),
        None => run_standalone(options),
    };
    let code = result.unwrap_or_else(|err| {
        error!("{}: {}", name, err);
        1
    });

    drop(guard);
    process::exit(code);
}
