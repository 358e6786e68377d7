//! A compiler from a Lisp dialect to an abstract JavaScript-like target tree.
//!
//! [`compiler`] holds the translator proper; [`runtime`] is the compile-time
//! host that executes macro expanders and `eval-when` forms.

pub mod compiler;
pub mod runtime;

pub use compiler::{CompileError, CompileResult, Compiler, CompilerOptions};
