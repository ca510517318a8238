use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use structopt::StructOpt;

/// Startup flags (SPEC_FULL.md §6.3), in the teacher's `structopt`-derived
/// options-struct idiom.
#[derive(Debug, StructOpt)]
#[structopt(name = "m68kdbg", about = "Source-level debugger for 68k targets")]
pub struct Options {
    /// Enable verbose (debug-level) logging
    #[structopt(short = "d", long = "debug")]
    pub debug: bool,

    /// Run as a remote server driven over the serial protocol instead of
    /// the local interactive console
    #[structopt(short = "s", long = "server")]
    pub server: bool,

    /// Path to the target executable to load
    #[structopt(name = "target", parse(from_os_str))]
    pub target: PathBuf,
}

/// Deployment-specific settings that the wire protocol itself has no
/// opinion on. Read from `m68kdbg.json` in the working directory if
/// present; defaults apply otherwise. Not part of the distilled spec,
/// but every complete server needs somewhere to put its serial-device
/// parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_serial_device")]
    pub serial_device: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_serial_device() -> String {
    "/dev/serial1".to_string()
}

fn default_baud_rate() -> u32 {
    19200
}

fn default_read_timeout_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Config {
            serial_device: default_serial_device(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Config {
    /// Loads `m68kdbg.json` from `dir` if it exists, else returns defaults.
    pub fn load(dir: &Path) -> Config {
        let path = dir.join("m68kdbg.json");
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(cfg) => cfg,
                Err(e) => {
                    crate::log!(
                        crate::log::LogLevel::Warn,
                        "ignoring malformed {}: {}",
                        path.display(),
                        e
                    );
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_absent() {
        let cfg = Config::load(Path::new("/nonexistent/path/for/test"));
        assert_eq!(cfg.baud_rate, 19200);
        assert_eq!(cfg.serial_device, "/dev/serial1");
    }

    #[test]
    fn parses_partial_json() {
        let cfg: Config = serde_json::from_str(r#"{"baudRate": 9600}"#).unwrap();
        assert_eq!(cfg.baud_rate, 9600);
        assert_eq!(cfg.serial_device, "/dev/serial1");
    }
}
