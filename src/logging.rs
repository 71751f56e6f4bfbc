//! Logging Setup
//!
//! The library logs through the `log` facade. Hosts that want the default
//! console format call [`init_logging`] once at startup.

use std::io::Write;

use log::Level;

/// Installs an `env_logger` backend.
///
/// `RUST_LOG` takes precedence; otherwise the level is `debug` when
/// `verbose` is set and `info` when not. Warnings and errors carry a level
/// prefix. Returns false when a logger was already installed.
pub fn init_logging(verbose: bool) -> bool {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| match record.level() {
            Level::Warn | Level::Error => {
                writeln!(buf, "[{}] {}: {}", record.level(), record.target(), record.args())
            }
            _ => writeln!(buf, "{}", record.args()),
        })
        .try_init()
        .is_ok()
}
