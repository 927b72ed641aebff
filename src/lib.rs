//! Adaptive JIT: the feedback-directed optimization loop of a dynamic-language VM
//!
//! The crate models the part of a virtual machine that watches a running
//! program and recompiles its hot methods: inline caches record receiver
//! classes, a scope tree is reconstructed from that feedback, an inliner
//! turns it into optimized code with type cases and uncommon traps, and a
//! recompilation policy decides which activation to recompile when counters
//! overflow or traps fire too often.
//!
//! # Quick Start
//!
//! ```no_run
//! use adaptive_jit::oop::{MethodBuilder, Operand};
//! use adaptive_jit::{LookupKey, Runtime};
//!
//! fn main() -> adaptive_jit::Result<()> {
//!     let mut runtime = Runtime::new();
//!     let classes = runtime.classes_mut();
//!     let point = classes.define_class("Point", None);
//!     let area = classes.intern("area");
//!     let foo = classes.intern("foo:");
//!     classes.add_method(point, MethodBuilder::new(area).work(3))?;
//!     let foo_m = classes.add_method(
//!         point,
//!         MethodBuilder::new(foo).args(1).send(area, Operand::Arg(0), vec![]),
//!     )?;
//!
//!     runtime.send_interpreted(foo_m, 0, point)?;
//!     let nm = runtime.compile(LookupKey::new(point, foo))?;
//!     println!("{:?}", runtime.code().get(nm));
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Object model** | [`oop`], [`lookup`] |
//! | **Feedback** | [`ic`], [`rscope`] |
//! | **Compilation** | [`jit`], [`code`] |
//! | **Adaptation** | [`trap`], [`recompile`], [`process`] |
//! | **Façade** | [`runtime`], [`config`](VmConfig), [`error`](Error) |
// Clippy configuration
//
// - too_many_arguments: trap handling and scope building thread several
//   tables through free functions
// - new_without_default: handle tables keep explicit constructors
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]

pub mod code;
pub mod config;
pub mod ic;
pub mod jit;
pub mod lookup;
pub mod oop;
pub mod prelude;
pub mod process;
pub mod recompile;
pub mod rscope;
pub mod runtime;
pub mod trap;

mod error;

pub use config::VmConfig;
pub use error::{Error, HandleKind, Result};
pub use lookup::LookupKey;
pub use runtime::{RecompileOutcome, Runtime, RuntimeStats, TrapReport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
