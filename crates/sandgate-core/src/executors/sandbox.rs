//! Process-level confinement applied between `fork` and `exec`.
//!
//! Everything in `ChildSandbox::apply` runs in the forked child, so it may
//! only make async-signal-safe calls: no allocation, no logging, no locks.

use std::io;

use crate::config::NetworkIsolation;

/// Ceilings and isolation for one child process.
#[derive(Debug, Clone, Copy)]
pub struct ChildSandbox {
    pub cpu_seconds: u64,
    pub address_space_bytes: u64,
    pub file_size_bytes: u64,
    pub open_files: u64,
    pub network: NetworkIsolation,
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Lowers a limit, never above the hard limit the parent already carries
/// (raising it needs privileges the service should not have).
macro_rules! lower_limit {
    ($resource:expr, $soft:expr, $hard:expr) => {{
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        check(libc::getrlimit($resource, &mut current))?;
        let hard = ($hard as libc::rlim_t).min(current.rlim_max);
        let soft = ($soft as libc::rlim_t).min(hard);
        check(libc::setrlimit(
            $resource,
            &libc::rlimit {
                rlim_cur: soft,
                rlim_max: hard,
            },
        ))
    }};
}

impl ChildSandbox {
    /// New session (so the whole tree can be killed as one group), private
    /// network namespace, then resource limits.
    ///
    /// # Safety
    ///
    /// Must only be called from a `pre_exec` hook in the freshly forked child.
    pub unsafe fn apply(&self) -> io::Result<()> {
        check(libc::setsid())?;

        self.enter_network_namespace()?;

        // The soft CPU limit delivers SIGXCPU; the hard one a second later is SIGKILL.
        lower_limit!(libc::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds + 1)?;
        lower_limit!(
            libc::RLIMIT_AS,
            self.address_space_bytes,
            self.address_space_bytes
        )?;
        lower_limit!(libc::RLIMIT_FSIZE, self.file_size_bytes, self.file_size_bytes)?;
        lower_limit!(libc::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        lower_limit!(libc::RLIMIT_CORE, 0, 0)?;

        Ok(())
    }

    #[cfg(target_os = "linux")]
    unsafe fn enter_network_namespace(&self) -> io::Result<()> {
        if self.network == NetworkIsolation::Disabled {
            return Ok(());
        }
        // A user namespace lets an unprivileged process own the new network
        // namespace, which starts with only a downed loopback interface.
        match check(libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET)) {
            Ok(()) => Ok(()),
            Err(e) if self.network == NetworkIsolation::Required => Err(e),
            Err(_) => Ok(()),
        }
    }

    #[cfg(not(target_os = "linux"))]
    unsafe fn enter_network_namespace(&self) -> io::Result<()> {
        match self.network {
            NetworkIsolation::Required => Err(io::Error::from(io::ErrorKind::Unsupported)),
            _ => Ok(()),
        }
    }
}

/// SIGKILL the process group led by `pid`. A group that is already gone is
/// not an error.
pub fn kill_process_group(pid: u32) -> io::Result<()> {
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Whether a spawn error means the host is temporarily out of capacity
/// rather than misconfigured.
pub fn is_capacity_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EAGAIN || code == libc::ENOMEM || code == libc::EMFILE || code == libc::ENFILE
    )
}
