//! Configuration files
//!
//! The server and every source/sink utility read the same two files,
//! `/etc/dvmixrc` then `~/.dvmixrc` with later values winning, so a
//! machine can point all of them at one mixer without repeating flags.
//! Lines are `KEY=VALUE`; blank lines, `#` comments and unknown keys
//! are ignored.

use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// System-wide configuration file
pub const SYSTEM_CONFIG_PATH: &str = "/etc/dvmixrc";

/// Per-user configuration file name, relative to `$HOME`
pub const USER_CONFIG_FILENAME: &str = ".dvmixrc";

/// Where to find the mixer, as far as the config files know
#[derive(Debug, Default, Clone)]
pub struct MixerSettings {
    /// `MIXER_HOST`: host the server binds and clients connect to
    pub host: Option<String>,
    /// `MIXER_PORT`: TCP port, same
    pub port: Option<String>,
}

impl MixerSettings {
    /// Read the standard configuration files. Missing files are fine;
    /// unreadable ones are skipped with a warning.
    pub fn load() -> Self {
        let mut settings = Self::default();
        if let Err(e) = settings.merge_path(Path::new(SYSTEM_CONFIG_PATH)) {
            tracing::warn!(error = %e, "Skipping configuration file");
        }
        if let Some(path) = user_config_path() {
            if let Err(e) = settings.merge_path(&path) {
                tracing::warn!(error = %e, "Skipping configuration file");
            }
        }
        settings
    }

    /// Merge one configuration file. A missing file is not an error;
    /// anything else unreadable about it is.
    pub fn merge_path(&mut self, path: &Path) -> Result<()> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::Config(format!("{}: {e}", path.display()))),
        };
        self.merge_reader(BufReader::new(file))
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Merge `KEY=VALUE` lines from a reader, later values winning.
    pub fn merge_reader<R: BufRead>(&mut self, reader: R) -> io::Result<()> {
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                self.apply(key.trim(), value.trim());
            }
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "MIXER_HOST" => self.host = Some(value.to_string()),
            "MIXER_PORT" => self.port = Some(value.to_string()),
            _ => {}
        }
    }
}

fn user_config_path() -> Option<PathBuf> {
    env::var_os("HOME").map(|home| Path::new(&home).join(USER_CONFIG_FILENAME))
}
