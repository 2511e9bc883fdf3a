//! Recursion guard for extraction invocations.
//!
//! Every child process spawned to run an extraction gets `GARDE_SUBAGENT=1`
//! in its environment. Any entry point that could start the pipeline (batch
//! runs, staged stores, hook-driven automation) must obtain a
//! [`ReentrancyToken`] first, and that fails when the variable is present.
//! The token is then passed explicitly down to the code that spawns children.

use tokio::process::Command;

use crate::error::{PipelineError, Result};

pub const GUARD_ENV: &str = "GARDE_SUBAGENT";

/// Proof that the current process is not itself running inside an
/// extraction invocation.
#[derive(Debug)]
pub struct ReentrancyToken {
    _private: (),
}

impl ReentrancyToken {
    /// Check the process environment.
    pub fn acquire() -> Result<Self> {
        Self::check(std::env::var_os(GUARD_ENV).is_some())
    }

    /// Check an explicit environment, for callers that read it themselves.
    pub fn from_vars<'a>(mut vars: impl Iterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        Self::check(vars.any(|(k, _)| k == GUARD_ENV))
    }

    fn check(guard_set: bool) -> Result<Self> {
        if guard_set {
            tracing::error!(env = GUARD_ENV, "refusing to re-enter the extraction pipeline");
            return Err(PipelineError::RecursionGuard(GUARD_ENV));
        }
        Ok(Self { _private: () })
    }

    /// Mark a child process so it cannot re-enter the pipeline.
    pub fn apply(&self, cmd: &mut Command) {
        cmd.env(GUARD_ENV, "1");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_var_blocks_acquire() {
        let vars = [("PATH", "/usr/bin"), (GUARD_ENV, "1")];
        let err = ReentrancyToken::from_vars(vars.iter().copied()).unwrap_err();
        assert!(matches!(err, PipelineError::RecursionGuard(GUARD_ENV)));
    }

    #[test]
    fn test_clean_env_acquires() {
        let vars = [("PATH", "/usr/bin")];
        assert!(ReentrancyToken::from_vars(vars.iter().copied()).is_ok());
    }
}
