/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! Line-oriented `key=value` configuration file reader, ported from
//! `original_source/include/util.h`'s `read_conf` and the key table on
//! `conf_t`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::LevelFilter;

/// Listen port used when the config omits `port` or sets it to `<= 0`.
pub const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub port: u16,
    pub thread_num: usize,
    pub log_level: LevelFilter,
    pub log_dir: PathBuf,
    pub prog_name: String,
    pub ip_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root: PathBuf::from("."),
            port: DEFAULT_PORT,
            thread_num: 4,
            log_level: LevelFilter::Info,
            log_dir: PathBuf::from("./logs"),
            prog_name: "swiftd".to_string(),
            ip_addr: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read(PathBuf, std::io::Error),
    MissingEquals { path: PathBuf, line_no: usize, line: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(path, e) => write!(f, "cannot read config file {:?}: {}", path, e),
            ConfigError::MissingEquals { path, line_no, line } => write!(
                f,
                "{}:{}: expected `key=value`, got {:?}",
                path.display(),
                line_no,
                line
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parses a `key=value` config file. Unknown keys are ignored; a line
/// (after trimming and stripping `#`-comments) with no `=` is a
/// configuration error that aborts startup with a diagnostic.
pub fn read_conf(path: &Path) -> Result<Config, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    let mut cfg = Config::default();

    for (idx, raw_line) in text.lines().enumerate() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::MissingEquals {
                path: path.to_path_buf(),
                line_no: idx + 1,
                line: raw_line.to_string(),
            });
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "root" => cfg.root = PathBuf::from(value),
            "port" => {
                let parsed: i64 = value.parse().unwrap_or(0);
                cfg.port = if parsed <= 0 { DEFAULT_PORT } else { parsed as u16 };
            }
            "threadnum" => {
                if let Ok(n) = value.parse() {
                    if n > 0 {
                        cfg.thread_num = n;
                    }
                }
            }
            "loglevel" => {
                if let Ok(n) = value.parse::<i64>() {
                    cfg.log_level = level_from_int(n);
                }
            }
            "logdir" => cfg.log_dir = PathBuf::from(value),
            "progname" => cfg.prog_name = value.to_string(),
            "ipaddr" => cfg.ip_addr = value.to_string(),
            // unknown keys are ignored.
            _ => {}
        }
    }

    Ok(cfg)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Maps the config's `loglevel` (1=FATAL ... 6=TRACE), clamped, onto
/// `log::LevelFilter`. There is no `Fatal` variant in the `log` facade, so
/// 1 and 2 both collapse onto `Error`.
fn level_from_int(n: i64) -> LevelFilter {
    match n.clamp(1, 6) {
        1 | 2 => LevelFilter::Error,
        3 => LevelFilter::Warn,
        4 => LevelFilter::Info,
        5 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_recognized_keys() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "root=/srv/www\nport=8080\nthreadnum=8\nloglevel=5\nlogdir=/var/log/swiftd\nprogname=swiftd\nipaddr=127.0.0.1\n# a comment\nunknownkey=ignored\n"
        )
        .unwrap();

        let cfg = read_conf(f.path()).unwrap();
        assert_eq!(cfg.root, PathBuf::from("/srv/www"));
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.thread_num, 8);
        assert_eq!(cfg.log_level, LevelFilter::Debug);
        assert_eq!(cfg.log_dir, PathBuf::from("/var/log/swiftd"));
        assert_eq!(cfg.prog_name, "swiftd");
        assert_eq!(cfg.ip_addr, "127.0.0.1");
    }

    #[test]
    fn non_positive_port_falls_back_to_default() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "port=0").unwrap();
        let cfg = read_conf(f.path()).unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
    }

    #[test]
    fn missing_equals_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "this line has no equals sign").unwrap();
        assert!(read_conf(f.path()).is_err());
    }
}
