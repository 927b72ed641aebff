//! Configuration for the adaptive optimization loop
//!
//! Every threshold the feedback loop consults lives here rather than in
//! constants, so embedders can tune cache sizes, trust limits, inlining costs
//! and recompilation distances. All sections deserialize from partial JSON:
//! missing fields take their default values.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default number of per-class entries in a polymorphic inline cache
pub const DEFAULT_PIC_ENTRIES: usize = 4;

/// Inline cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcConfig {
    /// Maximum number of class entries before a cache goes megamorphic
    pub max_entries: usize,
    /// Total PIC entries that may be live at once (code space for PIC stubs)
    pub pic_space_capacity: usize,
    /// Whether megamorphic stubs may be allocated at all
    pub megamorphic_stubs_enabled: bool,
}

impl Default for IcConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_PIC_ENTRIES,
            pic_space_capacity: 64 * 1024,
            megamorphic_stubs_enabled: true,
        }
    }
}

/// Type feedback (scope tree reconstruction) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Whether historical type feedback is consulted at all
    pub type_feedback: bool,
    /// Largest PIC whose contents are used when the caller is not trusted
    pub untrusted_pic_limit: usize,
    /// Largest PIC whose contents are used when the caller is trusted
    pub pic_trust_limit: usize,
    /// Invocations a callee native method needs before it is re-walked
    pub min_invocations_before_trust: u32,
    /// Compile epochs after which a callee native method is too old to re-walk
    pub max_rewalk_age: u64,
    /// Maximum nesting of re-walked native methods and interpreted scopes
    pub max_scope_depth: u32,
    /// Selectors whose monomorphic feedback is always trusted
    pub hot_arithmetic_selectors: Vec<String>,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            type_feedback: true,
            untrusted_pic_limit: 1,
            pic_trust_limit: DEFAULT_PIC_ENTRIES,
            min_invocations_before_trust: 10,
            max_rewalk_age: 1_000,
            max_scope_depth: 4,
            hot_arithmetic_selectors: ["+", "-", "*", "//", "\\\\", "<", "<=", ">", ">=", "=", "~="]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Inlining decision configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InliningConfig {
    /// Whether the inliner inlines anything at all
    pub enabled: bool,
    /// Cost limit for inlining a method
    pub max_method_inline_cost: u32,
    /// Cost limit for inlining a block
    pub max_block_inline_cost: u32,
    /// Extra allowed cost per argument statically known to be a block
    pub block_arg_additional_allowed_inline_cost: u32,
    /// Percentage of its home method's cost a block must reach to be inlined
    pub min_block_cost_fraction: u32,
    /// How often one method/class pair may appear on the inlining stack
    pub max_recursion_unroll: usize,
    /// Maximum nesting depth of inlined scopes
    pub max_inline_depth: usize,
    /// Compiled size above which the recompiler predicts no inlining
    pub max_compiled_inline_size: u32,
    /// Whether non-inlined sends are instrumented with invocation counters
    pub counting_sends: bool,
    /// Whether never-taken branches may be compiled as uncommon traps
    pub use_uncommon_traps: bool,
    /// Hot-path selectors inlined regardless of cost on primitive receivers
    pub builtin_selectors: Vec<String>,
}

impl Default for InliningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_method_inline_cost: 40,
            max_block_inline_cost: 60,
            block_arg_additional_allowed_inline_cost: 20,
            min_block_cost_fraction: 5,
            max_recursion_unroll: 1,
            max_inline_depth: 8,
            max_compiled_inline_size: 400,
            counting_sends: true,
            use_uncommon_traps: true,
            builtin_selectors: [
                "+", "-", "*", "<", "<=", ">", ">=", "=", "~=", "at:", "at:put:", "size",
                "ifTrue:", "ifFalse:", "ifTrue:ifFalse:", "and:", "or:", "not",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Recompilation candidate search configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecompileConfig {
    /// Interpreted frames the candidate search may cross
    pub max_interpreted_frames_crossed: usize,
    /// Total frames the candidate search may cross
    pub max_frames_crossed: usize,
    /// Versions a method may be compiled to before recompilation stops
    pub max_versions: u16,
    /// Highest optimization level
    pub max_optimization_level: u8,
    /// Invocations a native method needs before it may be recompiled
    pub min_invocations_before_recompile: u32,
    /// Invocation count that triggers (re)compilation
    pub invocation_limit: u32,
    /// Largest backoff exponent applied to the invocation limit
    pub max_backoff: u32,
}

impl Default for RecompileConfig {
    fn default() -> Self {
        Self {
            max_interpreted_frames_crossed: 3,
            max_frames_crossed: 8,
            max_versions: 4,
            max_optimization_level: 2,
            min_invocations_before_recompile: 100,
            invocation_limit: 10_000,
            max_backoff: 4,
        }
    }
}

/// Uncommon trap configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrapConfig {
    /// Trap firings of one native method that schedule a recompilation
    pub recompile_threshold: u32,
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self { recompile_threshold: 3 }
    }
}

/// Complete VM configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub ic: IcConfig,
    pub feedback: FeedbackConfig,
    pub inlining: InliningConfig,
    pub recompile: RecompileConfig,
    pub trap: TrapConfig,
}

impl VmConfig {
    /// Conservative configuration: little inlining, little trust
    pub fn conservative() -> Self {
        let mut config = Self::default();
        config.feedback.pic_trust_limit = 2;
        config.feedback.max_scope_depth = 2;
        config.inlining.max_method_inline_cost = 20;
        config.inlining.max_block_inline_cost = 30;
        config.inlining.max_inline_depth = 3;
        config.inlining.use_uncommon_traps = false;
        config
    }

    /// Aggressive configuration: deep inlining and eager traps
    pub fn aggressive() -> Self {
        let mut config = Self::default();
        config.feedback.untrusted_pic_limit = 2;
        config.feedback.max_scope_depth = 8;
        config.inlining.max_method_inline_cost = 120;
        config.inlining.max_block_inline_cost = 160;
        config.inlining.max_inline_depth = 16;
        config.inlining.max_recursion_unroll = 2;
        config.trap.recompile_threshold = 5;
        config
    }

    /// Parse a (possibly partial) JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: VmConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values that would break cache or search invariants
    pub fn validate(&self) -> Result<()> {
        if self.ic.max_entries < 2 {
            return Err(Error::config("ic.max_entries must be at least 2"));
        }
        if self.inlining.min_block_cost_fraction > 100 {
            return Err(Error::config("inlining.min_block_cost_fraction is a percentage"));
        }
        if self.recompile.max_frames_crossed == 0 {
            return Err(Error::config("recompile.max_frames_crossed must be positive"));
        }
        if self.recompile.max_interpreted_frames_crossed > self.recompile.max_frames_crossed {
            return Err(Error::config(
                "recompile.max_interpreted_frames_crossed exceeds max_frames_crossed",
            ));
        }
        if self.recompile.invocation_limit == 0 {
            return Err(Error::config("recompile.invocation_limit must be positive"));
        }
        if self.recompile.invocation_limit < self.recompile.min_invocations_before_recompile {
            return Err(Error::config(
                "recompile.invocation_limit is below min_invocations_before_recompile",
            ));
        }
        if self.recompile.max_versions == 0 {
            return Err(Error::config("recompile.max_versions must be positive"));
        }
        if self.trap.recompile_threshold == 0 {
            return Err(Error::config("trap.recompile_threshold must be positive"));
        }
        Ok(())
    }

    /// Invocation count needed before the next optimization, after `backoff`
    /// trap-driven recompilations
    pub fn effective_invocation_limit(&self, backoff: u32) -> u32 {
        let shift = backoff.min(self.recompile.max_backoff);
        self.recompile.invocation_limit.saturating_mul(1u32 << shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(VmConfig::default().validate().is_ok());
        assert!(VmConfig::conservative().validate().is_ok());
        assert!(VmConfig::aggressive().validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = VmConfig::from_json_str(r#"{ "ic": { "max_entries": 6 } }"#).unwrap();
        assert_eq!(config.ic.max_entries, 6);
        assert_eq!(config.ic.pic_space_capacity, IcConfig::default().pic_space_capacity);
        assert_eq!(config.inlining, InliningConfig::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = VmConfig::from_json_str(r#"{ "ic": { "max_entries": 1 } }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err =
            VmConfig::from_json_str(r#"{ "inlining": { "min_block_cost_fraction": 150 } }"#)
                .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invocation_limit_below_recompile_age_rejected() {
        let err = VmConfig::from_json_str(
            r#"{ "recompile": { "invocation_limit": 200, "min_invocations_before_recompile": 500 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let mut config = VmConfig::default();
        config.recompile.invocation_limit = 0;
        config.recompile.min_invocations_before_recompile = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = VmConfig::aggressive();
        let json = config.to_json().unwrap();
        assert_eq!(VmConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.json");
        fs::write(&path, r#"{ "trap": { "recompile_threshold": 9 } }"#).unwrap();
        let config = VmConfig::load(&path).unwrap();
        assert_eq!(config.trap.recompile_threshold, 9);
    }

    #[test]
    fn test_effective_invocation_limit_backoff() {
        let mut config = VmConfig::default();
        config.recompile.invocation_limit = 100;
        config.recompile.max_backoff = 3;
        assert_eq!(config.effective_invocation_limit(0), 100);
        assert_eq!(config.effective_invocation_limit(1), 200);
        assert_eq!(config.effective_invocation_limit(3), 800);
        assert_eq!(config.effective_invocation_limit(10), 800);
    }
}
