/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! Minimal argument parser for the CLI surface: `-c`/`--conf`,
//! `-V`/`--version`, `-h`/`-?`/`--help`. Kept deliberately thin; this module
//! exists only so the binary can be driven at all.

use std::path::PathBuf;

pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_CONF: &str = "swiftd.conf";

#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Run { conf_file: PathBuf },
    PrintHelp,
    PrintVersion,
}

fn usage() -> String {
    format!(
        "swiftd [option]...\n\
         \x20 -c|--conf <config file>  Specify config file. Default {DEFAULT_CONF}.\n\
         \x20 -?|-h|--help             This information.\n\
         \x20 -V|--version             Display program version.\n"
    )
}

/// Parses `argv[1..]`. Mirrors `original_source/src/Server.c`'s
/// `getopt_long` loop: `-c`/`--conf` takes a value, `-V`/`--version` and
/// `-h`/`-?`/`--help` short-circuit without reading a config file.
pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Action {
    let mut conf_file = PathBuf::from(DEFAULT_CONF);
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--conf" => {
                let Some(value) = iter.next() else {
                    eprint!("{}", usage());
                    return Action::PrintHelp;
                };
                conf_file = PathBuf::from(value);
            }
            "-V" | "--version" => return Action::PrintVersion,
            "-h" | "-?" | "--help" => return Action::PrintHelp,
            other => {
                eprintln!("unrecognized argument: {}", other);
                eprint!("{}", usage());
                return Action::PrintHelp;
            }
        }
    }

    Action::Run { conf_file }
}

pub fn print_usage() {
    eprint!("{}", usage());
}

pub fn print_version() {
    println!("{}", PROGRAM_VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &[&str]) -> Vec<String> {
        s.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_args_uses_default_conf_file() {
        assert_eq!(parse(args(&[])), Action::Run { conf_file: PathBuf::from(DEFAULT_CONF) });
    }

    #[test]
    fn conf_flag_overrides_path() {
        assert_eq!(
            parse(args(&["-c", "/etc/swiftd.conf"])),
            Action::Run { conf_file: PathBuf::from("/etc/swiftd.conf") }
        );
        assert_eq!(
            parse(args(&["--conf", "/etc/swiftd.conf"])),
            Action::Run { conf_file: PathBuf::from("/etc/swiftd.conf") }
        );
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert_eq!(parse(args(&["-h"])), Action::PrintHelp);
        assert_eq!(parse(args(&["-?"])), Action::PrintHelp);
        assert_eq!(parse(args(&["--help"])), Action::PrintHelp);
        assert_eq!(parse(args(&["-V"])), Action::PrintVersion);
        assert_eq!(parse(args(&["--version"])), Action::PrintVersion);
    }

    #[test]
    fn unrecognized_argument_prints_help() {
        assert_eq!(parse(args(&["--bogus"])), Action::PrintHelp);
    }
}
