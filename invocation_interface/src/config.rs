use crate::cache::CachePolicy;
use serde::Deserialize;

/// Settings threaded into every handle and skeleton at construction.
/// Stubs take a copy at the start of each call, so a call never observes a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct InvocationConfig {
    /// run the contract checks around every call
    #[serde(default = "checked_default")]
    pub checked: bool,
    #[serde(default)]
    pub cache_policy: CachePolicy,
    /// attach phase timestamps to every reply
    #[serde(default)]
    pub record_timings: bool,
}

fn checked_default() -> bool {
    cfg!(debug_assertions)
}

impl Default for InvocationConfig {
    fn default() -> Self {
        InvocationConfig {
            checked: checked_default(),
            cache_policy: CachePolicy::default(),
            record_timings: false,
        }
    }
}

impl InvocationConfig {
    pub fn checked() -> Self {
        InvocationConfig {
            checked: true,
            ..Self::default()
        }
    }
}
