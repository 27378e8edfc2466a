//! Logging init: `env_logger`, the same combination already present in
//! the teacher crate's dependency table and used throughout
//! `thrussh`/`thrussh-keys` via the `log` facade's macros.
//!
//! `-v` (repeatable, capped at three by `cli.rs`) raises the filter from
//! the default `warn` level up through `info`/`debug`/`trace`; `-q`
//! overrides to `error`-only. `-y` (syslog) is accepted at the CLI layer
//! but only ever logs a warning that this build has no syslog backend —
//! see `cli.rs`.

use crate::options::Options;

pub fn init(options: &Options) {
    let level = if options.quiet {
        log::LevelFilter::Error
    } else {
        match options.verbosity {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };

    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init();
}
