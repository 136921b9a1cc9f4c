//! Configuration knobs (spec.md §6), loaded from a simple `key = value`
//! text file the way the original reads `qm.ini`. Unknown keys are a hard
//! error rather than silently ignored.

use crate::error::{Result, StoreError};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Config {
    pub max_users: u32,
    pub numfiles: u32,
    pub numlocks: u32,
    pub num_glocks: u32,
    pub fds_limit: u32,
    pub deadlock_depth: u32,
    pub netfiles_enabled: bool,
    pub maxidlen: u16,
    pub must_lock: bool,
    pub safedir: String,
    pub fsync_policy: u8,
    pub qmsys_dir: String,
    pub terminfo_dir: String,
    pub journal_dir: String,
    pub journal_mode: u8,
    pub portmap_low: u16,
    pub portmap_high: u16,
    pub startup_command: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_users: 64,
            numfiles: 256,
            numlocks: 1024,
            num_glocks: 1024,
            fds_limit: 100,
            deadlock_depth: 10,
            netfiles_enabled: false,
            maxidlen: 255,
            must_lock: false,
            safedir: "/tmp".into(),
            fsync_policy: 0,
            qmsys_dir: "/usr/qmsys".into(),
            terminfo_dir: "/usr/share/terminfo".into(),
            journal_dir: "/var/log/store-journal".into(),
            journal_mode: 0,
            portmap_low: 4243,
            portmap_high: 4243,
            startup_command: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut raw = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                StoreError::Config(format!("line {}: expected key = value", lineno + 1))
            })?;
            raw.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        let mut cfg = Config::default();
        let known = [
            "max_users",
            "numfiles",
            "numlocks",
            "num_glocks",
            "fds_limit",
            "deadlock_depth",
            "netfiles_enabled",
            "maxidlen",
            "must_lock",
            "safedir",
            "fsync_policy",
            "qmsys_dir",
            "terminfo_dir",
            "journal_dir",
            "journal_mode",
            "portmap_low",
            "portmap_high",
            "startup_command",
        ];
        for key in raw.keys() {
            if !known.contains(&key.as_str()) {
                return Err(StoreError::Config(format!("unknown config key '{}'", key)));
            }
        }

        macro_rules! num {
            ($name:literal, $field:ident) => {
                if let Some(v) = raw.get($name) {
                    cfg.$field = v
                        .parse()
                        .map_err(|_| StoreError::Config(format!("bad value for {}", $name)))?;
                }
            };
        }
        macro_rules! boolean {
            ($name:literal, $field:ident) => {
                if let Some(v) = raw.get($name) {
                    cfg.$field = matches!(v.as_str(), "1" | "true" | "yes" | "on");
                }
            };
        }
        macro_rules! string {
            ($name:literal, $field:ident) => {
                if let Some(v) = raw.get($name) {
                    cfg.$field = v.clone();
                }
            };
        }

        num!("max_users", max_users);
        num!("numfiles", numfiles);
        num!("numlocks", numlocks);
        num!("num_glocks", num_glocks);
        num!("fds_limit", fds_limit);
        num!("deadlock_depth", deadlock_depth);
        boolean!("netfiles_enabled", netfiles_enabled);
        num!("maxidlen", maxidlen);
        boolean!("must_lock", must_lock);
        string!("safedir", safedir);
        num!("fsync_policy", fsync_policy);
        string!("qmsys_dir", qmsys_dir);
        string!("terminfo_dir", terminfo_dir);
        string!("journal_dir", journal_dir);
        num!("journal_mode", journal_mode);
        num!("portmap_low", portmap_low);
        num!("portmap_high", portmap_high);
        string!("startup_command", startup_command);

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys() {
        let cfg = Config::parse("max_users = 16\nnumlocks=200\n# comment\n").unwrap();
        assert_eq!(cfg.max_users, 16);
        assert_eq!(cfg.numlocks, 200);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = Config::parse("bogus_knob = 1\n").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }
}
