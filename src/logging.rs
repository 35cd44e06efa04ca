use std::fmt::Display;

use colored::Colorize;
use log::{Level, LevelFilter, SetLoggerError};

/// External crates only need to log warnings and errors
const EXTERNAL_LEVEL: LevelFilter = LevelFilter::Warn;

/// Installs the logger. `verbose` lets our own crates log at debug level,
/// which includes echo suppression and drift decisions.
pub fn init_logger(verbose: bool) -> Result<(), SetLoggerError> {
    let local_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    fern::Dispatch::new()
        .format(move |out, message, record| {
            let target = Target::from_str(record.target());
            let now = chrono::Local::now();

            out.finish(format_args!(
                "{:^5} {} {:^8} {}",
                level_to_string(&record.level()),
                now.format("%H:%M:%S").to_string().bright_black(),
                target,
                message
            ))
        })
        .filter(move |meta| {
            let target = Target::from_str(meta.target());

            if target.is_local() {
                meta.level() <= local_level
            } else {
                meta.level() <= EXTERNAL_LEVEL
            }
        })
        .chain(std::io::stdout())
        .apply()
}

enum Target {
    External(String),
    App,
    Collab,
    Impls,
    Core,
}

impl Target {
    fn from_str(str: &str) -> Self {
        let module = str.split("::").next().unwrap_or_default();

        match module {
            "coview" => Self::App,
            "coview_core" => Self::Core,
            "coview_impls" => Self::Impls,
            "coview_collab" => Self::Collab,
            other => Target::External(other.to_string()),
        }
    }

    fn is_local(&self) -> bool {
        !matches!(self, Self::External(_))
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            Target::External(x) => x.as_str().clear(),
            Target::App => "APP".bright_green(),
            Target::Collab => "COLLAB".bright_purple(),
            Target::Impls => "IMPLS".cyan(),
            Target::Core => "CORE".blue(),
        };

        Display::fmt(&result, f)
    }
}

fn level_to_string(level: &Level) -> String {
    match level {
        Level::Error => " ERR ".black().on_red().bold().to_string(),
        Level::Warn => " WRN ".black().on_yellow().bold().to_string(),
        Level::Info => " INF ".black().on_blue().bold().to_string(),
        Level::Debug => " DBG ".white().on_black().to_string(),
        Level::Trace => " TRC ".to_string(),
    }
}
