//! Per-run build state and post-transaction steps.
//!
//! - `context`: paths of one assembly run and the environment its child
//!   processes get
//! - `modules`: kernel module dependency generation

pub mod context;
pub mod modules;

pub use context::{BuildContext, TransactionEnv};
pub use modules::KernelModuleDepResolver;
