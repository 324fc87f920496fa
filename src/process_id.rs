// Process identities for ownership slots
//
// A pid alone cannot name a process across time because the kernel reuses
// pids. Pairing the pid with the process start time from /proc/<pid>/stat
// (field 22, in jiffies since boot) makes the identity unique: a recycled pid
// gets a different boot_time, so stale ownership records never match a new
// process.
//
// The in-memory representation matches the 16-byte on-shelf cell bit for bit
// so a ProcessID can be compare-and-stored as one u128.

use std::fmt;
use tracing::warn;

/// `(pid, boot_time)`; all-zero means "no owner".
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct ProcessID {
    pid: u64,
    boot_time: u64,
}

impl ProcessID {
    pub const NONE: ProcessID = ProcessID {
        pid: 0,
        boot_time: 0,
    };

    /// Identity of the calling process.
    pub fn current() -> Self {
        // Safety: getpid never fails.
        let pid = unsafe { libc::getpid() } as u64;
        Self::for_pid(pid)
    }

    /// Identity of an arbitrary pid; yields `NONE` if the process does not
    /// exist (its stat file is unreadable).
    pub fn for_pid(pid: u64) -> Self {
        let boot_time = read_boot_time(pid);
        if boot_time == 0 {
            Self::NONE
        } else {
            Self { pid, boot_time }
        }
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn is_valid(&self) -> bool {
        self.pid != 0 && self.boot_time != 0
    }

    /// Probes whether the recorded process is still the one running under
    /// this pid. Signal 0 checks existence; a matching boot_time rules out
    /// pid reuse. Probe errors other than ESRCH are treated as "alive unless
    /// the boot_time changed" so permission failures never trigger revocation.
    pub fn is_alive(&self) -> bool {
        debug_assert!(self.is_valid());
        // Safety: kill with signal 0 only validates the pid.
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, 0) };
        if rc == 0 {
            return read_boot_time(self.pid) == self.boot_time;
        }
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::ESRCH) {
            return false;
        }
        warn!(pid = self.pid, error = %errno, "liveness probe failed");
        read_boot_time(self.pid) == self.boot_time
    }

    pub fn to_u128(&self) -> u128 {
        (self.pid as u128) | ((self.boot_time as u128) << 64)
    }

    pub fn from_u128(raw: u128) -> Self {
        Self {
            pid: raw as u64,
            boot_time: (raw >> 64) as u64,
        }
    }
}

impl fmt::Display for ProcessID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.pid, self.boot_time)
    }
}

impl fmt::Debug for ProcessID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Field 22 of /proc/<pid>/stat, 0 if the process is gone. Field 2 is the
/// executable name in parentheses and may itself contain spaces, so counting
/// starts after the closing parenthesis.
fn read_boot_time(pid: u64) -> u64 {
    let text = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(text) => text,
        Err(_) => return 0,
    };
    let after_comm = match text.rfind(')') {
        Some(pos) => &text[pos + 1..],
        None => return 0,
    };
    // after_comm starts at field 3; starttime is field 22
    after_comm
        .split_whitespace()
        .nth(19)
        .and_then(|field| field.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_is_valid_and_alive() {
        let me = ProcessID::current();
        assert!(me.is_valid());
        assert!(me.is_alive());
    }

    #[test]
    fn test_none_is_invalid() {
        assert!(!ProcessID::NONE.is_valid());
        assert_eq!(ProcessID::default(), ProcessID::NONE);
    }

    #[test]
    fn test_u128_roundtrip() {
        let me = ProcessID::current();
        assert_eq!(ProcessID::from_u128(me.to_u128()), me);
        assert_eq!(ProcessID::NONE.to_u128(), 0);
    }

    #[test]
    fn test_dead_pid_detected() {
        // spawn and reap a child; its identity must read as dead afterwards
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as u64;
        let id = ProcessID::for_pid(pid);
        child.wait().unwrap();
        if id.is_valid() {
            assert!(!id.is_alive());
        }
    }
}
