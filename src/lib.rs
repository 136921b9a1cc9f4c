//! A disk-resident key/value store with a dynamic-hash primary file, AK
//! secondary indices, multi-process group/record locking over a shared
//! control region, and a transaction cache layered on top.

pub mod akindex;
pub mod config;
pub mod control;
pub mod dirfile;
pub mod error;
pub mod glock;
pub mod hashfile;
pub mod layout;
pub mod netfile;
pub mod record;
pub mod rlock;
pub mod select;
pub mod subfile;
pub mod triggers;
pub mod txn;
pub mod types;
pub mod users;

pub use error::{Result, StoreError};

use std::sync::atomic::AtomicBool;
use std::sync::Once;

static LOG_INIT: Once = Once::new();

/// Initialises `env_logger` exactly once; safe to call from every entry
/// point (library consumers, the CLI, tests) without double-installing
/// the global logger.
pub fn init_logs() {
    LOG_INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_millis()
            .init();
    });
}

/// Process-wide flag honoured by write paths: the admin CLI's
/// suspend/resume-updates subcommand flips this, and `HashFile::write`/
/// `HashFile::delete` check it before taking any lock.
pub static UPDATES_SUSPENDED: AtomicBool = AtomicBool::new(false);

#[cfg(test)]
mod tests {
    #[test]
    fn init_logs_is_idempotent() {
        super::init_logs();
        super::init_logs();
    }
}
