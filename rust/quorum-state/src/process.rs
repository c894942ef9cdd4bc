//! Process identity and liveness helpers for lock staleness checks.

/// Pid of the calling process.
#[must_use]
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Hostname of this machine, or `"unknown"` when it cannot be read.
#[must_use]
pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Whether the given OS process id is currently running.
///
/// Uses signal 0 probing on Unix; a permission error still means the
/// process exists.
#[cfg(unix)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap, reason = "OS pids fit in i32")]
    let pid = Pid::from_raw(pid as i32);
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether the given OS process id is currently running.
///
/// Without a portable probe, only the calling process is reported alive.
#[cfg(not(unix))]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    pid == current_pid()
}
