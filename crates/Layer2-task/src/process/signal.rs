//! Signal delivery

use crate::artifact::ProcessRef;
use mult_foundation::{Error, Result};
use tracing::debug;

/// Signals the engine sends to task processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
    Stop,
    Cont,
}

impl Signal {
    fn raw(&self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
            Signal::Stop => libc::SIGSTOP,
            Signal::Cont => libc::SIGCONT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Stop => "SIGSTOP",
            Signal::Cont => "SIGCONT",
        }
    }
}

/// Send `signal` to one pid. `Ok(false)` when the process is already gone.
pub fn send(pid: i32, signal: Signal) -> Result<bool> {
    if pid <= 0 {
        return Ok(false);
    }
    let rc = unsafe { libc::kill(pid, signal.raw()) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        _ => Err(Error::Process(format!(
            "failed to send {} to {}: {}",
            signal.name(),
            pid,
            err
        ))),
    }
}

/// Signal every process; keeps going past failures and returns the first
pub fn send_all<'a>(processes: impl IntoIterator<Item = &'a ProcessRef>, signal: Signal) -> Result<usize> {
    let mut delivered = 0;
    let mut first_error = None;
    for process in processes {
        match send(process.pid, signal) {
            Ok(true) => delivered += 1,
            Ok(false) => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    debug!("{} delivered to {} processes", signal.name(), delivered);
    match first_error {
        Some(e) => Err(e),
        None => Ok(delivered),
    }
}

/// Shell-style exit code: the status code, or 128 + signal when killed
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::proc::{identify, is_alive};

    #[test]
    fn test_missing_pid_is_not_an_error() {
        assert!(!send(0, Signal::Term).unwrap());
        assert!(!send(-4, Signal::Kill).unwrap());
    }

    #[test]
    fn test_term_stops_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let identity = identify(child.id() as i32).unwrap();

        assert_eq!(send_all([&identity], Signal::Term).unwrap(), 1);
        let status = child.wait().unwrap();
        assert!(!is_alive(&identity));
        assert_eq!(exit_code(status), 128 + libc::SIGTERM);
    }

    #[test]
    fn test_exit_code_of_normal_exit() {
        let status = std::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .status()
            .unwrap();
        assert_eq!(exit_code(status), 3);
    }
}
