//! Tool descriptors and dispatch.
//!
//! Every capability the model can call is a [`Tool`] trait implementor,
//! registered in a [`ToolRegistry`] by name. The [`ToolDispatcher`] turns each
//! model-requested call into exactly one [`ToolOutcome`]; failures are
//! values, never errors.
//!
//! # Defining tools
//!
//! - **[`FnTool`]** — closure over a typed argument struct. Pair it with
//!   [`json_schema_for`](crate::json_schema_for) to derive the schema.
//! - **`impl Tool`** — full struct with manual [`Tool::definition()`] and
//!   [`Tool::execute()`]. Best for tools with state.
//!
//! # Submodules
//!
//! - [`core`] — [`Tool`] trait, [`ToolRegistry`], [`FnTool`], logging and
//!   truncation helpers.
//! - [`dispatch`] — [`ToolDispatcher`], [`ToolOutcome`], [`ToolFailure`].
//! - [`failure`] — [`FailureTracker`] for repeated identical failures.

pub mod core;
pub mod dispatch;
pub mod failure;

pub use core::{
    DEFAULT_MAX_RESULT_BYTES, DEFAULT_TOOL_TIMEOUT, FnTool, Tool, ToolFuture, ToolRegistry,
    log_tool_call, truncate_result,
};
pub use dispatch::{Deadline, ToolDispatcher, ToolFailure, ToolOutcome};
pub use failure::{FailureStreak, FailureTracker};
