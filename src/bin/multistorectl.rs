//! Admin CLI (spec.md §6): start/stop the shared control region, kill a
//! user by id or login, kill all, recover vanished users, show users, and
//! suspend/resume updates. Mirrors the daemonising fork/retry pattern the
//! original mount tool used, minus anything FUSE-specific.

use anyhow::{anyhow, Result};
use clap::{arg, command, ArgAction};
use fork::{fork, Fork};
use log::info;
use multistore::control::ControlRegion;
use multistore::users::UserTable;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use retry::delay::Fixed;
use retry::{retry_with_index, OperationResult};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

fn region_path(safedir: &str) -> PathBuf {
    PathBuf::from(safedir).join("multistore.ctl")
}

fn main() -> Result<()> {
    multistore::init_logs();

    let matches = command!()
        .subcommand_required(true)
        .arg(
            arg!(--safedir <DIR> "Directory holding the shared control region file")
                .required(false)
                .default_value("/tmp"),
        )
        .subcommand(
            clap::Command::new("start")
                .about("Create (or attach) the shared control region")
                .arg(arg!(-f --front "Stay in the foreground instead of forking").action(ArgAction::SetTrue)),
        )
        .subcommand(
            clap::Command::new("stop")
                .about("Stop the control region; a second invocation forces termination")
                .arg(arg!(--force "Force immediate termination").action(ArgAction::SetTrue)),
        )
        .subcommand(
            clap::Command::new("kill")
                .about("Kill a user by numeric id or login name")
                .arg(arg!(--id <USER_ID> "Numeric user id").required(false))
                .arg(arg!(--login <LOGIN> "Login name").required(false)),
        )
        .subcommand(clap::Command::new("kill-all").about("Kill every attached user"))
        .subcommand(
            clap::Command::new("recover")
                .about("Recover users whose processes have vanished"),
        )
        .subcommand(clap::Command::new("show-users").about("List attached users"))
        .subcommand(clap::Command::new("suspend").about("Suspend all updates"))
        .subcommand(clap::Command::new("resume").about("Resume updates"))
        .get_matches();

    let safedir = matches.get_one::<String>("safedir").unwrap().clone();

    match matches.subcommand() {
        Some(("start", sub)) => cmd_start(&safedir, sub.get_flag("front")),
        Some(("stop", sub)) => cmd_stop(&safedir, sub.get_flag("force")),
        Some(("kill", sub)) => cmd_kill(
            sub.get_one::<String>("id").map(|s| s.as_str()),
            sub.get_one::<String>("login").map(|s| s.as_str()),
        ),
        Some(("kill-all", _)) => cmd_kill_all(),
        Some(("recover", _)) => cmd_recover(),
        Some(("show-users", _)) => cmd_show_users(),
        Some(("suspend", _)) => cmd_suspend(true),
        Some(("resume", _)) => cmd_suspend(false),
        _ => unreachable!("subcommand_required enforces this"),
    }
}

fn cmd_start(safedir: &str, front: bool) -> Result<()> {
    let path = region_path(safedir);
    let retry_times = 3;
    match if front { Ok(Fork::Child) } else { fork() } {
        Ok(Fork::Parent(child)) => {
            info!("control region owner running at pid: {}", child);
            Ok(())
        }
        Ok(Fork::Child) => {
            match retry_with_index(Fixed::from_millis(100), |current_try| {
                info!("[try {}/{}] opening control region at {:?}", current_try, retry_times, path);
                match ControlRegion::open_or_create(&path, 4096) {
                    Ok(_) => OperationResult::Ok(()),
                    Err(e) if current_try > retry_times => {
                        OperationResult::Err(format!("failed to open control region: {}", e))
                    }
                    Err(_) => OperationResult::Retry("retrying control region open".into()),
                }
            }) {
                Ok(_) => {
                    info!("control region ready");
                    Ok(())
                }
                Err(e) => Err(anyhow!("start failed: {}", e)),
            }
        }
        Err(e) => Err(anyhow!("fork returned error {}", e)),
    }
}

fn cmd_stop(safedir: &str, force: bool) -> Result<()> {
    let path = region_path(safedir);
    if !path.exists() {
        return Err(anyhow!("control region not present at {:?}", path));
    }
    if force {
        std::fs::remove_file(&path)?;
        info!("control region forcibly removed");
    } else {
        let region = ControlRegion::open_or_create(&path, 4096)?;
        region.force_clear_sems();
        info!("control region marked stopping; run `stop --force` again to remove it");
    }
    Ok(())
}

fn cmd_kill(id: Option<&str>, login: Option<&str>) -> Result<()> {
    let mut table = UserTable::new();
    let entry = match (id, login) {
        (Some(id), _) => {
            let uid: i16 = id.parse()?;
            table.by_id(uid).cloned()
        }
        (None, Some(login)) => table.by_login(login).cloned(),
        (None, None) => return Err(anyhow!("kill requires --id or --login")),
    };
    match entry {
        Some(e) => {
            signal::kill(Pid::from_raw(e.pid), Signal::SIGTERM)?;
            table.detach(e.user_id);
            info!("sent SIGTERM to user {} (pid {})", e.user_id, e.pid);
            Ok(())
        }
        None => Err(anyhow!("no matching user")),
    }
}

fn cmd_kill_all() -> Result<()> {
    let table = UserTable::new();
    for entry in table.list() {
        signal::kill(Pid::from_raw(entry.pid), Signal::SIGTERM).ok();
        info!("sent SIGTERM to user {} (pid {})", entry.user_id, entry.pid);
    }
    Ok(())
}

fn cmd_recover() -> Result<()> {
    let mut table = UserTable::new();
    let vanished = table.recover_vanished(|e| {
        info!("releasing locks held by vanished user {}", e.user_id);
    });
    info!("recovered {} vanished users", vanished.len());
    Ok(())
}

fn cmd_show_users() -> Result<()> {
    let table = UserTable::new();
    for entry in table.list() {
        println!("{}\t{}\t{}", entry.user_id, entry.pid, entry.login);
    }
    Ok(())
}

fn cmd_suspend(suspend: bool) -> Result<()> {
    multistore::UPDATES_SUSPENDED.store(suspend, Ordering::SeqCst);
    info!("updates {}", if suspend { "suspended" } else { "resumed" });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_path_joins_safedir() {
        assert_eq!(region_path("/tmp"), PathBuf::from("/tmp/multistore.ctl"));
    }
}
