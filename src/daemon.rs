//! Double-fork daemonization with output redirected to a log file.

use std::ffi::CString;
use std::io;

fn check(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Detach from the controlling terminal. The parent processes exit here;
/// only the grandchild returns. Stdout and stderr land in `log_path`.
pub fn daemonize(log_path: &str) -> io::Result<()> {
    unsafe {
        if check(libc::fork())? > 0 {
            libc::_exit(0);
        }
        check(libc::setsid())?;
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
        if check(libc::fork())? > 0 {
            libc::_exit(0);
        }
        libc::umask(0);
        let root = CString::new("/").unwrap();
        check(libc::chdir(root.as_ptr()))?;

        let devnull = CString::new("/dev/null").unwrap();
        let stdin_fd = check(libc::open(devnull.as_ptr(), libc::O_RDONLY))?;
        check(libc::dup2(stdin_fd, libc::STDIN_FILENO))?;
        if stdin_fd != libc::STDIN_FILENO {
            libc::close(stdin_fd);
        }

        let log = CString::new(log_path).map_err(|_| io::ErrorKind::InvalidInput)?;
        let log_fd = check(libc::open(
            log.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
            0o644,
        ))?;
        check(libc::dup2(log_fd, libc::STDOUT_FILENO))?;
        check(libc::dup2(log_fd, libc::STDERR_FILENO))?;
        if log_fd != libc::STDOUT_FILENO && log_fd != libc::STDERR_FILENO {
            libc::close(log_fd);
        }
    }
    Ok(())
}
