// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Forking children and reaping them again.
//!
//! The child half of [`spawn`] cannot report launch problems through normal
//! channels, so it reports them through its exit code using the `sysexits`
//! convention: `EX_NOPERM` for a permission problem, `EX_NOINPUT` when no
//! candidate path existed, `EX_DATAERR` for an unrunnable binary format and
//! `EX_UNAVAILABLE` for everything else (including a failed chdir). The
//! death handling on the parent side decodes these.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process;

use nix::errno::Errno;
use nix::sys::stat::{stat, SFlag};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, execve, fork, ForkResult, Pid};
use tracing::{info, warn};

use crate::program::{DownType, Program};
use crate::Error;

// `sysexits.h` values; the libc crate does not expose these on Linux.
pub(crate) const EX_DATAERR: i32 = 65;
pub(crate) const EX_NOINPUT: i32 = 66;
pub(crate) const EX_UNAVAILABLE: i32 = 69;
pub(crate) const EX_NOPERM: i32 = 77;

/// A reaped child, classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Death {
    pub pid: i32,
    pub down: DownType,
    /// Exit code for [`DownType::Exited`], 0 otherwise.
    pub code: i32,
}

/// Fork and exec one program, returning the child pid to the caller.
///
/// All argv/env conversion happens before the fork; the child only changes
/// directory, raises its core limit, and walks the candidate paths.
pub fn spawn(program: &Program) -> Result<Pid, Error> {
    let candidates = program
        .candidates()
        .iter()
        .map(|p| cstring_path(p))
        .collect::<Result<Vec<_>, Error>>()?;
    let args = program
        .args()
        .iter()
        .map(|a| cstring(a))
        .collect::<Result<Vec<_>, Error>>()?;
    let env = program
        .env()
        .iter()
        .map(|(k, v)| cstring(&format!("{}={}", k, v)))
        .collect::<Result<Vec<_>, Error>>()?;

    match fork()? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => exec_child(program, &candidates, &args, &env),
    }
}

fn exec_child(program: &Program, candidates: &[CString], args: &[CString], env: &[CString]) -> ! {
    if let Some(wd) = program.cwd() {
        if let Err(err) = chdir(wd) {
            eprintln!("failed to chdir(\"{}\"): {}", wd.display(), err);
            process::exit(EX_UNAVAILABLE);
        }
    }

    // the child may dump core even where the supervisor could not
    let core = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    unsafe {
        libc::setrlimit(libc::RLIMIT_CORE, &core);
    }

    let env_refs: Vec<&CStr> = env.iter().map(|e| e.as_c_str()).collect();

    let mut perm = false;
    let mut badbin = false;
    let mut neverfound = true;

    for (i, candidate) in candidates.iter().enumerate() {
        let mut argv: Vec<&CStr> = Vec::with_capacity(args.len() + 1);
        argv.push(candidate.as_c_str());
        argv.extend(args.iter().map(|a| a.as_c_str()));

        // returns only on failure
        let _ = execve(candidate.as_c_str(), &argv, &env_refs);

        let mut notfound = false;
        match Errno::last() {
            Errno::EACCES => {
                // execve also raises EACCES when the path is not a regular
                // file; count that as no binary found instead
                if is_regular(&program.candidates()[i]) {
                    perm = true;
                } else {
                    notfound = true;
                }
            }
            Errno::ENOENT
            | Errno::ESTALE
            | Errno::ENOTDIR
            | Errno::ETIMEDOUT
            | Errno::ENODEV => notfound = true,
            Errno::ENOEXEC => badbin = true,
            _ => (),
        }
        neverfound = neverfound && notfound;
    }

    // still here, so every exec failed; report the most telling reason
    if perm {
        process::exit(EX_NOPERM);
    } else if neverfound {
        process::exit(EX_NOINPUT);
    } else if badbin {
        process::exit(EX_DATAERR);
    } else {
        process::exit(EX_UNAVAILABLE);
    }
}

/// Collect every child that has died since the last call. Non-blocking;
/// stops at the first still-running child or when no children remain.
pub fn reap() -> Vec<Death> {
    let mut deaths = Vec::new();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(WaitStatus::Exited(pid, code)) => {
                info!("child pid={} died. exited:true status:{}", pid.as_raw(), code);
                deaths.push(Death {
                    pid: pid.as_raw(),
                    down: DownType::Exited,
                    code,
                });
            }
            Ok(WaitStatus::Signaled(pid, signal, core_dumped)) => {
                info!(
                    "child pid={} died. exited:false signal:{:?}",
                    pid.as_raw(),
                    signal
                );
                deaths.push(Death {
                    pid: pid.as_raw(),
                    down: if core_dumped {
                        DownType::Dumped
                    } else {
                        DownType::Killed
                    },
                    code: 0,
                });
            }
            // stopped/continued children are not deaths
            Ok(_) => continue,
            Err(err) => {
                if err.as_errno() != Some(Errno::ECHILD) {
                    warn!("waitpid failed: {}", err);
                }
                break;
            }
        }
    }
    deaths
}

/// Candidate paths for a command: the command itself when it carries a
/// slash, otherwise one candidate per `$PATH` entry.
pub fn search(command: &str, path_dirs: &[PathBuf]) -> Vec<PathBuf> {
    if command.contains('/') {
        vec![PathBuf::from(command)]
    } else {
        path_dirs.iter().map(|dir| dir.join(command)).collect()
    }
}

/// Whether at least one candidate is a runnable regular file.
pub fn any_executable(candidates: &[PathBuf]) -> bool {
    candidates.iter().any(|c| is_executable(c))
}

fn is_executable(path: &Path) -> bool {
    let path_c = match cstring_path(path) {
        Ok(c) => c,
        Err(_) => return false,
    };
    if unsafe { libc::access(path_c.as_ptr(), libc::X_OK) } != 0 {
        return false;
    }
    is_regular(path)
}

fn is_regular(path: &Path) -> bool {
    match stat(path) {
        Ok(st) => SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT == SFlag::S_IFREG,
        Err(_) => false,
    }
}

fn cstring(s: &str) -> Result<CString, Error> {
    CString::new(s).map_err(|_| Error::from(format!("nul byte in \"{}\"", s)))
}

fn cstring_path(path: &Path) -> Result<CString, Error> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::from(format!("nul byte in path {}", path.display())))
}
