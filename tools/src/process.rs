//! Subprocess lifecycle helpers.

/// RAII guard that kills a child process (and its process group on Unix) on
/// drop.
///
/// Wrap a spawned `tokio::process::Child` immediately after `spawn()` so the
/// process cannot outlive a cancelled future. Call `disarm()` after the
/// process has been reaped.
pub struct ChildGuard {
    child: Option<tokio::process::Child>,
}

impl ChildGuard {
    #[must_use]
    pub fn new(child: tokio::process::Child) -> Self {
        Self { child: Some(child) }
    }

    pub fn child_mut(&mut self) -> &mut tokio::process::Child {
        self.child.as_mut().expect("child present")
    }

    pub fn disarm(&mut self) {
        self.child = None;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                if kill_process_group(pid).is_err() {
                    let _ = child.start_kill();
                }
            } else {
                let _ = child.start_kill();
            }
            let _ = child.try_wait();
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
            let _ = child.try_wait();
        }
    }
}

/// Terminate the process group rooted at `pid` (Unix), or the process itself
/// elsewhere.
///
/// The sandbox starts every child in its own session, so pid == process
/// group id and forked descendants die with it. A group that already exited
/// is not an error.
pub(crate) fn kill_process_group(pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    // SAFETY: plain libc call; pid is a process group we created.
    unsafe {
        if libc::killpg(pid as i32, libc::SIGKILL) == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Ok(())
    }
}

/// Put the child in its own session (Unix only) so the whole group can be
/// killed via `killpg`. On Linux the child additionally dies with us.
#[cfg(unix)]
pub(crate) fn set_new_session(cmd: &mut tokio::process::Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: pre_exec runs between fork and exec; setsid/prctl are
    // async-signal-safe.
    unsafe {
        cmd.as_std_mut().pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            #[cfg(target_os = "linux")]
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub(crate) fn set_new_session(_cmd: &mut tokio::process::Command) {}
