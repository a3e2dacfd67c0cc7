//! Worker configuration, read once from the environment at startup.

use std::env;
use std::path::PathBuf;

use anyhow::{Result, bail};
use tracing::warn;

/// Immutable capability set derived from the environment. The boolean
/// flags use presence-means-true semantics; the numeric caps treat 0 as
/// unset.
///
/// Only `allow_eval` is enforced by the worker itself (the `eval` and
/// `Function` globals are deleted before the bundle runs). The other
/// flags are advertised to the engine host for a sandbox layer to honour.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub allow_filesystem: bool,
    pub allow_network: bool,
    pub allow_child_process: bool,
    pub allow_eval: bool,
    pub max_memory_bytes: u64,
    pub max_fds: u64,
}

impl Capabilities {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        // Reserved for a future JSON capability document; read so a
        // supervisor setting it doesn't trip anything, but not parsed.
        let _ = lookup("CAPABILITIES");

        Self {
            allow_filesystem: lookup("ALLOW_FILESYSTEM").is_some(),
            allow_network: lookup("ALLOW_NETWORK").is_some(),
            allow_child_process: lookup("ALLOW_CHILD_PROCESS").is_some(),
            allow_eval: lookup("ALLOW_EVAL").is_some(),
            max_memory_bytes: parse_limit("MAX_MEMORY", lookup("MAX_MEMORY")),
            max_fds: parse_limit("MAX_FDS", lookup("MAX_FDS")),
        }
    }
}

fn parse_limit(name: &str, value: Option<String>) -> u64 {
    let Some(value) = value else { return 0 };
    match value.trim().parse() {
        Ok(limit) => limit,
        Err(_) => {
            warn!("ignoring {name}={value:?}: not a decimal integer");
            0
        }
    }
}

/// Everything the worker needs to start serving.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity used for the `ready` record. Synthesized from the pid
    /// when the supervisor doesn't assign one.
    pub worker_id: String,
    pub bundle_path: PathBuf,
    pub capabilities: Capabilities,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let worker_id = env::var("WORKER_ID")
            .ok()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("worker-{}", std::process::id()));

        let bundle_path = match env::var_os("BUNDLE_PATH") {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => bail!("BUNDLE_PATH environment variable is required"),
        };

        Ok(Self {
            worker_id,
            bundle_path,
            capabilities: Capabilities::from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn caps(vars: &[(&str, &str)]) -> Capabilities {
        let vars: HashMap<_, _> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Capabilities::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn everything_denied_by_default() {
        let caps = caps(&[]);

        assert!(!caps.allow_filesystem);
        assert!(!caps.allow_network);
        assert!(!caps.allow_child_process);
        assert!(!caps.allow_eval);
        assert_eq!(caps.max_memory_bytes, 0);
        assert_eq!(caps.max_fds, 0);
    }

    #[test]
    fn presence_grants_a_flag_regardless_of_value() {
        let caps = caps(&[("ALLOW_EVAL", ""), ("ALLOW_NETWORK", "false")]);

        assert!(caps.allow_eval);
        assert!(caps.allow_network);
        assert!(!caps.allow_filesystem);
    }

    #[test]
    fn numeric_limits_parse_as_decimal_bytes() {
        let caps = caps(&[("MAX_MEMORY", "268435456"), ("MAX_FDS", "64")]);

        assert_eq!(caps.max_memory_bytes, 268_435_456);
        assert_eq!(caps.max_fds, 64);
    }

    #[test]
    fn unparseable_limits_fall_back_to_unset() {
        let caps = caps(&[("MAX_MEMORY", "lots"), ("MAX_FDS", "-3")]);

        assert_eq!(caps.max_memory_bytes, 0);
        assert_eq!(caps.max_fds, 0);
    }
}
