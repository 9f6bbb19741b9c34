use log::{Level, LevelFilter, log_enabled};
use std::io::Write;

pub fn init(verbosity: u8) {
    let mut builder = env_logger::Builder::from_default_env();

    builder
        .format_indent(Some(8))
        .filter(None, verbosity_level(verbosity))
        .format(|f, record| {
            let style = f.default_level_style(record.level()).bold();
            write!(f, "{style}{:>6}{style:#} ", prettyprint_level(record.level()))?;

            if log_enabled!(Level::Debug) {
                write!(f, "[{}] ", record.target())?;
            }

            writeln!(f, "{}", record.args())
        })
        .init();
}

/// Maps the number of `-v` flags to a level filter. Without any, only
/// warnings reach the terminal so they don't tear through progress bars.
fn verbosity_level(num: u8) -> LevelFilter {
    match num {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        3.. => LevelFilter::Trace,
    }
}

fn prettyprint_level(lvl: Level) -> &'static str {
    match lvl {
        Level::Error => "Error",
        Level::Warn => "Warn",
        Level::Info => "Info",
        Level::Debug => "Debug",
        Level::Trace => "Trace",
    }
}
