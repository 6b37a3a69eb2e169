//! Custom Resource Definitions for FnStack
//!
//! This module defines the Function and Profile resources the operator
//! manages in declarative mode.

mod function;
mod profile;
pub mod types;


pub use function::{
    validate_function_name, Function, FunctionSpec, FunctionStatus, SpecValidationError,
};
pub use profile::{Profile, ProfileSpec};
pub use types::*;
