use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

pub const ARG_SUBMISSIONS_FILE: &str = "submissions-file";
pub const ARG_FALLBACK_DIR: &str = "fallback-dir";

#[derive(Debug, Clone)]
pub struct Options {
    pub submissions_file: PathBuf,
    pub fallback_dir: PathBuf,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        let path = |id: &str, default: &str| {
            matches
                .get_one::<String>(id)
                .map_or_else(|| PathBuf::from(default), PathBuf::from)
        };
        Self {
            submissions_file: path(ARG_SUBMISSIONS_FILE, "submissions_tracking.json"),
            fallback_dir: path(ARG_FALLBACK_DIR, "submissions"),
        }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SUBMISSIONS_FILE)
                .long(ARG_SUBMISSIONS_FILE)
                .help("JSON file recording verified submissions")
                .env("CONTACTGATE_SUBMISSIONS_FILE")
                .default_value("submissions_tracking.json"),
        )
        .arg(
            Arg::new(ARG_FALLBACK_DIR)
                .long(ARG_FALLBACK_DIR)
                .help("Directory for submissions that could not be delivered")
                .env("CONTACTGATE_FALLBACK_DIR")
                .default_value("submissions"),
        )
}
