//! Kumade core library.
//!
//! An embeddable, GNU-Make-compatible build engine: a variable expander,
//! makefile parser, rule resolver, and parallel build runner, with every
//! effect routed through injected capabilities so hosts and tests control
//! the filesystem, shell, and concurrency.
//!
//! The usual flow is [`engine::Engine::parse_str`] (or `parse_file`)
//! followed by [`engine::Engine::run`]:
//!
//! ```no_run
//! use kumade::caps::Capabilities;
//! use kumade::engine::Engine;
//! use kumade::run::RunOptions;
//!
//! # fn main() -> Result<(), kumade::error::MakeError> {
//! let engine = Engine::new(Capabilities::host());
//! engine.parse_str("hello:\n\techo hello\n", None)?;
//! let ran = engine.run(&["hello".into()], RunOptions::default())?;
//! assert!(ran);
//! # Ok(()) }
//! ```

pub mod caps;
pub mod engine;
pub mod error;
pub mod expand;
pub mod funcs;
pub mod parse;
pub mod resolve;
pub mod rules;
pub mod run;
pub mod vars;
