//! Best-effort POSIX resource limits, applied before the engine exists.
//!
//! Lowering a limit can fail (some hosts don't honour `RLIMIT_AS` at
//! all); failures are reported to stderr and startup continues.

use crate::config::Capabilities;

#[cfg(unix)]
pub fn apply(caps: &Capabilities) {
    lower(libc::RLIMIT_AS, "RLIMIT_AS", caps.max_memory_bytes);
    lower(libc::RLIMIT_NOFILE, "RLIMIT_NOFILE", caps.max_fds);
}

#[cfg(not(unix))]
pub fn apply(_caps: &Capabilities) {}

// glibc types the resource argument as an enum; every other libc takes an int.
#[cfg(all(unix, target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(target_env = "gnu")))]
type Resource = libc::c_int;

#[cfg(unix)]
fn lower(resource: Resource, name: &str, limit: u64) {
    use tracing::warn;

    if limit == 0 {
        return;
    }

    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: rlim is a valid, writable rlimit struct.
    if unsafe { libc::getrlimit(resource, &mut rlim) } != 0 {
        warn!(
            "failed to read {name}: {}",
            std::io::Error::last_os_error()
        );
        return;
    }

    // The soft limit can only be lowered up to the current hard limit.
    rlim.rlim_cur = std::cmp::min(limit, rlim.rlim_max);
    // SAFETY: rlim holds the limits read above with a lowered soft cap.
    if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
        warn!(
            "failed to lower {name} to {}: {}",
            rlim.rlim_cur,
            std::io::Error::last_os_error()
        );
    }
}
