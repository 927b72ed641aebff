//! Prelude module for convenient imports
//!
//! ```no_run
//! use adaptive_jit::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let mut runtime = Runtime::with_config(VmConfig::aggressive())?;
//!     let point = runtime.classes_mut().define_class("Point", None);
//!     println!("{}", runtime.classes().class_name(point));
//!     Ok(())
//! }
//! ```

// Runtime façade
pub use crate::runtime::{RecompileOutcome, Runtime, RuntimeStats, TrapReport};

// Error handling
pub use crate::error::{Error, HandleKind, Result};

// Configuration
pub use crate::config::VmConfig;

// Object model
pub use crate::lookup::LookupKey;
pub use crate::oop::{ClassId, ClassTable, InlineHint, MethodBuilder, MethodId, Operand, Selector};

// Feedback and compilation
pub use crate::code::{NativeMethod, NativeMethodId};
pub use crate::ic::{IcFlags, IcTransition, InlineCache, Target};
pub use crate::jit::{Compilation, CompilationContext, SendResolution};
pub use crate::recompile::{DeclineReason, RecompileTrigger};
pub use crate::rscope::{InliningDatabase, ScopeTree};
