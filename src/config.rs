// Boot command-line configuration.
//
// The boot loader passes one whitespace-separated string of key=value
// words; unknown words are ignored so loaders can carry their own.

use log::LevelFilter;

use crate::param::PATH_MAX;

pub struct BootConfig {
    first: [u8; PATH_MAX],
    first_len: usize,
    pub loglevel: LevelFilter,
    pub kdisplay: u64,
}

impl BootConfig {
    /// Name of the first user program (pid 2).
    pub fn first(&self) -> &[u8] {
        &self.first[..self.first_len]
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        let mut c = BootConfig {
            first: [0; PATH_MAX],
            first_len: 0,
            loglevel: LevelFilter::Info,
            kdisplay: 1,
        };
        c.set_first(b"allocexit");
        c
    }
}

impl BootConfig {
    fn set_first(&mut self, name: &[u8]) {
        let n = name.len().min(PATH_MAX);
        self.first[..n].copy_from_slice(&name[..n]);
        self.first_len = n;
    }
}

pub fn parse(command: &str) -> BootConfig {
    let mut c = BootConfig::default();
    for word in command.split_whitespace() {
        let (key, value) = match word.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        match key {
            "first" if !value.is_empty() => c.set_first(value.as_bytes()),
            "loglevel" => {
                c.loglevel = match value {
                    "off" => LevelFilter::Off,
                    "error" => LevelFilter::Error,
                    "warn" => LevelFilter::Warn,
                    "info" => LevelFilter::Info,
                    "debug" => LevelFilter::Debug,
                    "trace" => LevelFilter::Trace,
                    _ => c.loglevel,
                }
            }
            "kdisplay" => {
                if let Ok(mode) = value.parse() {
                    c.kdisplay = mode;
                }
            }
            _ => {}
        }
    }
    c
}
