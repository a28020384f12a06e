//! Bookkeeping for every process a run spawned, read from `/proc`.
//!
//! A program can leave its process group with `setsid()`, so killing the group
//! is not enough. The run's leader and the judge are both child subreapers:
//! while the leader lives its orphans stay below it, and once it is gone they
//! are handed to the judge instead of init. Every poll records the current
//! descendants so the ones handed to the judge are still known to belong to
//! this run.

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpid, getuid, Pid};
use std::collections::HashMap;
use std::fs;
use std::thread::sleep;
use std::time::{Duration, Instant};

const FREEZE_ROUNDS: usize = 50;
const REAP_TIMEOUT: Duration = Duration::from_secs(1);
const REAP_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct ProcStat {
    pid: i32,
    ppid: i32,
    start_time: u64,
    zombie: bool,
}

/// Parses `/proc/<pid>/stat`. The command name may hold spaces and
/// parentheses, so fields are counted from the last `)`.
fn parse_stat(pid: i32, stat: &str) -> Option<ProcStat> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some(ProcStat {
        pid,
        zombie: *fields.first()? == "Z",
        ppid: fields.get(1)?.parse().ok()?,
        start_time: fields.get(19)?.parse().ok()?,
    })
}

fn read_stat(pid: i32) -> Option<ProcStat> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat(pid, &stat)
}

fn snapshot() -> Vec<ProcStat> {
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Couldn't list /proc: {}", e);
            return vec![];
        }
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse().ok()?;
            read_stat(pid)
        })
        .collect()
}

/// Number of tasks (threads included) owned by the judge's real user, which
/// is what `RLIMIT_NPROC` is checked against.
pub(super) fn user_task_count() -> u64 {
    let uid = getuid().as_raw().to_string();
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| fs::read_to_string(entry.path().join("status")).ok())
        .filter(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("Uid:"))
                .and_then(|ids| ids.split_whitespace().next())
                == Some(uid.as_str())
        })
        .filter_map(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("Threads:"))
                .and_then(|count| count.trim().parse::<u64>().ok())
        })
        .sum()
}

fn signal(pid: i32, signal: Signal) {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Couldn't send {} to {}: {}", signal, pid, e),
    }
}

pub(super) struct ProcessTree {
    leader: i32,
    /// Descendants seen so far, keyed by pid, with their start time so a
    /// recycled pid is never mistaken for one of ours.
    members: HashMap<i32, u64>,
}

impl ProcessTree {
    pub(super) fn new(leader: Pid) -> Self {
        ProcessTree {
            leader: leader.as_raw(),
            members: HashMap::new(),
        }
    }

    /// Records the live descendants and returns them. The leader is only a
    /// root while it is unreaped, since its pid is ours until then.
    pub(super) fn refresh(&mut self, leader_unreaped: bool) -> Vec<ProcStat> {
        let processes = snapshot();
        let mut tree: HashMap<i32, ProcStat> = processes
            .iter()
            .filter(|p| {
                (leader_unreaped && p.pid == self.leader)
                    || self.members.get(&p.pid) == Some(&p.start_time)
            })
            .map(|p| (p.pid, *p))
            .collect();
        loop {
            let known = tree.len();
            for p in &processes {
                if !tree.contains_key(&p.pid) && tree.contains_key(&p.ppid) {
                    tree.insert(p.pid, *p);
                }
            }
            if tree.len() == known {
                break;
            }
        }

        for p in tree.values().filter(|p| p.pid != self.leader) {
            self.members.insert(p.pid, p.start_time);
        }
        tree.into_values().filter(|p| !p.zombie).collect()
    }

    /// Stops every live descendant, then kills them all. Stopped processes
    /// can't fork, so nothing escapes between the scan and the kill.
    pub(super) fn kill_all(&mut self, leader_unreaped: bool) {
        let mut stopped: Vec<i32> = vec![];
        for _ in 0..FREEZE_ROUNDS {
            let live = self.refresh(leader_unreaped);
            let fresh: Vec<i32> = live
                .iter()
                .map(|p| p.pid)
                .filter(|pid| !stopped.contains(pid))
                .collect();
            if fresh.is_empty() {
                break;
            }
            for &pid in &fresh {
                signal(pid, Signal::SIGSTOP);
            }
            stopped.extend(fresh);
        }
        for pid in stopped {
            signal(pid, Signal::SIGKILL);
        }
    }

    /// Waits on the descendants that were handed to the judge, so none of
    /// them is left as a zombie. Must run after the leader is reaped.
    pub(super) fn reap(&self) {
        let judge = getpid().as_raw();
        let mut pending: Vec<(i32, u64)> = self.members.iter().map(|(&p, &t)| (p, t)).collect();
        let give_up = Instant::now() + REAP_TIMEOUT;

        while !pending.is_empty() && Instant::now() < give_up {
            pending.retain(|&(pid, start_time)| match read_stat(pid) {
                Some(stat) if stat.start_time != start_time => false,
                Some(stat) if stat.ppid == judge => {
                    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::StillAlive) => true,
                        Ok(_) | Err(Errno::ECHILD) => false,
                        Err(e) => {
                            warn!("Couldn't reap {}: {}", pid, e);
                            false
                        }
                    }
                }
                // Still owned by a dying member; it will be handed over.
                Some(stat) => self.members.contains_key(&stat.ppid),
                None => false,
            });
            if !pending.is_empty() {
                sleep(REAP_INTERVAL);
            }
        }
        if !pending.is_empty() {
            debug!("Gave up reaping {} processes", pending.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_fields_are_counted_from_the_last_parenthesis() {
        let stat = "4242 (a (b) c) S 17 4242 4242 0 -1 4194560 100 0 0 0 \
                    1 2 0 0 20 0 1 0 987654 1000 10 18446744073709551615";
        assert_eq!(
            parse_stat(4242, stat),
            Some(ProcStat {
                pid: 4242,
                ppid: 17,
                start_time: 987654,
                zombie: false,
            })
        );
        assert_eq!(parse_stat(1, "1 (init"), None);
    }

    #[test]
    fn the_judge_sees_itself() {
        let me = read_stat(getpid().as_raw()).unwrap();
        assert!(!me.zombie);
        assert!(user_task_count() >= 1);
    }
}
