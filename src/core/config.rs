// This module holds the knobs of the back end. BackendConfig selects the target, the
// scratch register reserved for materialising 64-bit immediates and far addresses, the
// prefix used for synthesized return-address labels, and the CallPolicy. The call
// policy is the injectable whitelist the GC root tracker consults: `noreturn` targets
// end a block without producing a safe point, and `no_gc` targets return normally but
// can never trigger a collection so they are not recorded either. from_env() overlays
// ASMGCROOT_TARGET, ASMGCROOT_NO_GC_CALLS and ASMGCROOT_NORETURN_CALLS on the defaults.

//! Back-end configuration.

use hashbrown::HashSet;
use log::debug;

use super::location::{regs, Reg, Target};

/// Calls that the GC root tracker does not record as safe points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPolicy {
    /// Targets that never return. The block ends at the call.
    pub noreturn: HashSet<String>,
    /// Targets that return but never collect. The walk continues.
    pub no_gc: HashSet<String>,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            noreturn: ["abort", "_exit", "__assert_fail"]
                .into_iter()
                .map(String::from)
                .collect(),
            no_gc: HashSet::new(),
        }
    }
}

impl CallPolicy {
    /// A policy with no exemptions at all.
    pub fn empty() -> Self {
        Self {
            noreturn: HashSet::new(),
            no_gc: HashSet::new(),
        }
    }

    pub fn with_noreturn<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.noreturn.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_no_gc<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.no_gc.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn is_noreturn(&self, target: &str) -> bool {
        self.noreturn.contains(target)
    }

    pub fn is_no_gc(&self, target: &str) -> bool {
        self.no_gc.contains(target)
    }

    /// Whether a call to `target` is exempt from safe-point recording.
    pub fn is_exempt(&self, target: &str) -> bool {
        self.is_noreturn(target) || self.is_no_gc(target)
    }
}

/// Configuration shared by the encoder, reconciler and tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub target: Target,
    pub scratch: Option<Reg>,
    pub call_policy: CallPolicy,
    pub label_prefix: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::for_target(Target::X86_64)
    }
}

impl BackendConfig {
    pub const DEFAULT_LABEL_PREFIX: &'static str = "__gcmap_IN_";

    /// Defaults for `target`: r11 is the scratch register on x86-64, and
    /// x86-32 has none to spare.
    pub fn for_target(target: Target) -> Self {
        let scratch = match target {
            Target::X86_64 => Some(regs::R11),
            Target::X86_32 => None,
        };
        Self {
            target,
            scratch,
            call_policy: CallPolicy::default(),
            label_prefix: Self::DEFAULT_LABEL_PREFIX.to_string(),
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        if self.target != target {
            let defaults = Self::for_target(target);
            self.scratch = defaults.scratch;
        }
        self.target = target;
        self
    }

    pub fn with_scratch(mut self, scratch: Option<Reg>) -> Self {
        self.scratch = scratch;
        self
    }

    pub fn with_call_policy(mut self, call_policy: CallPolicy) -> Self {
        self.call_policy = call_policy;
        self
    }

    pub fn with_label_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.label_prefix = prefix.into();
        self
    }

    /// Defaults overlaid with `ASMGCROOT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup("ASMGCROOT_TARGET") {
            match value.trim().to_ascii_lowercase().as_str() {
                "x86_32" | "x86-32" | "i386" => config = config.with_target(Target::X86_32),
                "x86_64" | "x86-64" | "amd64" => config = config.with_target(Target::X86_64),
                other => debug!("ignoring unknown ASMGCROOT_TARGET value {other:?}"),
            }
        }
        if let Some(value) = lookup("ASMGCROOT_NO_GC_CALLS") {
            config.call_policy = config.call_policy.with_no_gc(split_names(&value));
        }
        if let Some(value) = lookup("ASMGCROOT_NORETURN_CALLS") {
            config.call_policy = config.call_policy.with_noreturn(split_names(&value));
        }

        debug!(
            "backend config: target={} scratch={:?} no_gc={} noreturn={}",
            config.target,
            config.scratch,
            config.call_policy.no_gc.len(),
            config.call_policy.noreturn.len()
        );
        config
    }
}

fn split_names(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}
