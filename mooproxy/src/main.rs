//! mooproxy - a resilient intercepting proxy for MUD/MOO connections.
//!
//! This binary wires the pieces together: command line, configuration
//! directories, the world's config file, the lock file, signal handlers,
//! the listen sockets, the initial server connection, and finally the
//! event loop.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Arg, ArgAction, Command};

use moocore::config;
use moocore::engine::{self, Engine};
use moocore::logging::{self, info, Severity};
use moocore::net::listener;
use moocore::shared::{
    StartupError, EXIT_BIND, EXIT_CONFIGDIRS, EXIT_HELP, EXIT_HOMEDIR, EXIT_NOAUTH, EXIT_NOWORLD,
    EXIT_OK, EXIT_SOCKET, EXIT_UNKNOWNOPT,
};
use moocore::util;
use moocore::world::World;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const HELP_TEXT: &str = "\
mooproxy - a proxy for MUD/MOO connections

usage: mooproxy [options]

-h, --help        shows this help screen and exits
-V, --version     shows version information and exits
-L, --license     shows licensing information and exits
-w, --world NAME  world to load

mooproxy comes with ABSOLUTELY NO WARRANTY; for details run mooproxy --license";

const LICENSE_TEXT: &str = "\
mooproxy - a proxy for MUD/MOO connections

This program is free software; you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; version 2 dated June, 1991.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.";

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let matches = match build_cli().try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            eprintln!("{}", err);
            return EXIT_UNKNOWNOPT;
        }
    };

    if matches.get_flag("help") {
        println!("{}", HELP_TEXT);
        return EXIT_HELP;
    }
    if matches.get_flag("version") {
        println!("mooproxy version {}.", VERSION);
        return EXIT_HELP;
    }
    if matches.get_flag("license") {
        println!("{}", LICENSE_TEXT);
        return EXIT_HELP;
    }

    let worldname = match matches.get_one::<String>("world") {
        Some(name) if !name.is_empty() => name.clone(),
        _ => {
            eprintln!("You must supply a world name.");
            return EXIT_NOWORLD;
        }
    };

    println!(
        "Starting mooproxy {} at {}.",
        VERSION,
        util::time_string(util::current_time(), "%c")
    );

    match serve(worldname) {
        Ok(()) => EXIT_OK,
        Err(err) => {
            eprintln!("{}", err.message);
            err.code
        }
    }
}

fn build_cli() -> Command {
    Command::new("mooproxy")
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(
            Arg::new("help")
                .short('h')
                .long("help")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("version")
                .short('V')
                .long("version")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("license")
                .short('L')
                .long("license")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("world")
                .short('w')
                .long("world")
                .value_name("NAME"),
        )
}

fn serve(worldname: String) -> Result<(), StartupError> {
    let home = dirs::home_dir().ok_or_else(|| {
        StartupError::new(EXIT_HOMEDIR, "Could not determine your home directory.")
    })?;

    install_panic_hook(home.clone());
    setup_signal_handlers();

    let base = create_config_dirs(&home)?;

    let log = logging::init(Severity::Info);
    let mut world = World::new(worldname.clone(), base.join("logs"), &log);

    let configfile = base.join("worlds").join(&worldname);
    world.configfile = Some(configfile.clone());

    println!("Loading config...");
    config::load_config_file(&mut world, &configfile)?;

    // Refuse to run a world anyone could walk into.
    if !world.auth.is_set() {
        return Err(StartupError::new(
            EXIT_NOAUTH,
            "Authstring must be non-empty. Refusing to start.",
        ));
    }

    let _lock = acquire_lock(&base, &worldname)?;

    println!("Binding port...");
    let port = world
        .listenport
        .ok_or_else(|| StartupError::new(EXIT_BIND, "No port defined to listen on."))?;
    let bind = listener::bind_port(port)?;
    for msg in &bind.af_msg {
        println!("{}", msg);
    }
    println!("{}", bind.conclusion);
    world.listeners = bind.listeners;

    println!("Connecting...");
    world.connect_blocking()?;

    info!(log, "world ready"; "world" => &worldname);
    println!("Opened world {}.", worldname);
    println!("Ready for connections.");

    let mut engine = Engine::new(&log)
        .map_err(|err| StartupError::new(EXIT_SOCKET, format!("Could not create poll: {}", err)))?;
    engine.run(&mut world);

    Ok(())
}

/// Create `~/.mooproxy` and its subdirectories, mode 0700. Returns the
/// base directory.
fn create_config_dirs(home: &Path) -> Result<PathBuf, StartupError> {
    let base = home.join(".mooproxy");

    for dir in &[
        base.clone(),
        base.join("worlds"),
        base.join("logs"),
        base.join("locks"),
    ] {
        attempt_createdir(dir)?;
    }

    Ok(base)
}

fn attempt_createdir(path: &Path) -> Result<(), StartupError> {
    let mut builder = fs::DirBuilder::new();
    builder.mode(0o700);

    match builder.create(path) {
        Ok(()) => Ok(()),
        Err(ref err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            if path.is_dir() {
                Ok(())
            } else {
                Err(StartupError::new(
                    EXIT_CONFIGDIRS,
                    format!("`{}' exists, but it is not a directory.", path.display()),
                ))
            }
        }
        Err(err) => Err(StartupError::new(
            EXIT_CONFIGDIRS,
            format!("Could not create directory `{}': {}", path.display(), err),
        )),
    }
}

/// Take the world's advisory lock, refusing to run two mooproxies for
/// the same world. The lock lives as long as the returned file.
fn acquire_lock(base: &Path, world: &str) -> Result<File, StartupError> {
    let path = base.join("locks").join(world);

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .mode(0o600)
        .open(&path)
        .map_err(|err| {
            StartupError::new(
                EXIT_CONFIGDIRS,
                format!("Could not open lock file `{}': {}", path.display(), err),
            )
        })?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(StartupError::new(
            EXIT_CONFIGDIRS,
            format!(
                "World `{}' is already in use (could not lock `{}').",
                world,
                path.display()
            ),
        ));
    }

    Ok(file)
}

extern "C" fn handle_term_signal(_: libc::c_int) {
    engine::request_shutdown();
}

fn setup_signal_handlers() {
    let handler = handle_term_signal as extern "C" fn(libc::c_int);

    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

/// On panic: one line to stderr, one line to the crash file, then exit.
fn install_panic_hook(home: PathBuf) {
    std::panic::set_hook(Box::new(move |info| {
        let msg = format!("mooproxy panic: {}", info).replace('\n', " ");
        eprintln!("{}", msg);

        let crashfile = home.join("mooproxy.crash");
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&crashfile) {
            let _ = writeln!(
                file,
                "{}  {}",
                util::time_string(util::current_time(), "%Y-%m-%d %T"),
                msg
            );
        }

        process::exit(1);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_create_config_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let base = create_config_dirs(dir.path()).unwrap();

        for sub in &["worlds", "logs", "locks"] {
            let path = base.join(sub);
            assert!(path.is_dir());
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        // Idempotent on existing directories.
        create_config_dirs(dir.path()).unwrap();
    }

    #[test]
    fn test_createdir_refuses_file_in_the_way() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obstacle");
        fs::write(&path, b"not a dir").unwrap();

        let err = attempt_createdir(&path).unwrap_err();
        assert_eq!(err.code, EXIT_CONFIGDIRS);
        assert!(err.message.contains("not a directory"));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let base = create_config_dirs(dir.path()).unwrap();

        let _held = acquire_lock(&base, "w").unwrap();
        let second = acquire_lock(&base, "w");
        assert!(second.is_err());
        assert!(second.unwrap_err().message.contains("already in use"));

        // A different world locks fine.
        acquire_lock(&base, "other").unwrap();
    }

    #[test]
    fn test_cli_accepts_world_flag() {
        let matches = build_cli()
            .try_get_matches_from(["mooproxy", "-w", "dreamland"])
            .unwrap();
        assert_eq!(
            matches.get_one::<String>("world").map(String::as_str),
            Some("dreamland")
        );

        assert!(build_cli()
            .try_get_matches_from(["mooproxy", "--bogus"])
            .is_err());
    }
}
