//! Pseudo-terminal process spawning.
//!
//! A child gets two pseudo-terminals: the primary one is its controlling
//! terminal and carries stdin/stdout, the secondary one carries stderr so
//! the two output streams stay distinguishable on the wire.

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::libc;
use nix::pty::{openpty, OpenptyResult};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;
use tracing::info;
use undine_core::{UndineError, UndineResult};

/// Master-side handles of a spawned child.
pub struct PtyProcess {
    pub pid: Pid,
    /// Reads the child's stdout.
    pub output: File,
    /// Writes to the child's stdin.
    pub input: File,
    /// Reads the child's stderr.
    pub errors: File,
}

/// Termination details captured by the reaper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitState {
    pub success: bool,
    /// `exit status <n>` or `signal: <NAME>`.
    pub message: String,
    /// Exit code, -1 when the process did not exit normally.
    pub code: i32,
    pub user_time: Duration,
    pub sys_time: Duration,
}

/// Spawn `program` with `args` attached to a fresh pseudo-terminal pair.
pub fn spawn(program: &str, args: &[String]) -> UndineResult<PtyProcess> {
    let primary = open_pair()?;
    let secondary = open_pair()?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::from(primary.slave.try_clone()?))
        .stdout(Stdio::from(primary.slave.try_clone()?))
        .stderr(Stdio::from(secondary.slave.try_clone()?));

    // SAFETY: only async-signal-safe calls between fork and exec. stdin is
    // already the primary slave at this point.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| classify_spawn_error(program, e))?;
    // The parent must not keep slave ends open or the masters never see EOF.
    drop(cmd);
    drop(primary.slave);
    drop(secondary.slave);

    let pid = Pid::from_raw(child.id() as i32);
    info!(pid = pid.as_raw(), program, "child spawned");

    let output = File::from(primary.master);
    let input = output.try_clone()?;
    Ok(PtyProcess {
        pid,
        output,
        input,
        errors: File::from(secondary.master),
    })
}

fn open_pair() -> UndineResult<OpenptyResult> {
    let pair = openpty(None, None)
        .map_err(|e| UndineError::Spawn(format!("failed to open PTY: {e}")))?;
    // Later children must not inherit these.
    set_cloexec(&pair.master)?;
    set_cloexec(&pair.slave)?;
    Ok(pair)
}

fn set_cloexec(fd: &OwnedFd) -> UndineResult<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| UndineError::Spawn(format!("fcntl F_SETFD: {e}")))?;
    Ok(())
}

fn classify_spawn_error(program: &str, e: io::Error) -> UndineError {
    match e.kind() {
        ErrorKind::NotFound => UndineError::ExecNotFound(format!("{program}: {e}")),
        _ => UndineError::Spawn(format!("{program}: {e}")),
    }
}

/// Block until `pid` terminates and collect its status and CPU usage.
///
/// Stops and continues are not reported by `wait4` without `WUNTRACED`,
/// so the first successful return is the final one.
pub fn wait_for_exit(pid: Pid) -> io::Result<ExitState> {
    let mut status: libc::c_int = 0;
    // SAFETY: zeroed rusage is a valid out-parameter.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: both pointers reference live stack values.
        let ret = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut usage) };
        if ret >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }

    let status = ExitStatus::from_raw(status);
    Ok(ExitState {
        success: status.success(),
        message: describe(&status),
        code: status.code().unwrap_or(-1),
        user_time: timeval_duration(usage.ru_utime),
        sys_time: timeval_duration(usage.ru_stime),
    })
}

fn describe(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit status {code}");
    }
    match status.signal() {
        Some(sig) => {
            let name = Signal::try_from(sig)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| sig.to_string());
            if status.core_dumped() {
                format!("signal: {name} (core dumped)")
            } else {
                format!("signal: {name}")
            }
        }
        None => "unknown exit status".to_string(),
    }
}

fn timeval_duration(tv: libc::timeval) -> Duration {
    let secs = u64::try_from(tv.tv_sec).unwrap_or(0);
    let micros = u32::try_from(tv.tv_usec).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(u64::from(micros))
}
