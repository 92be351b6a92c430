//! CLI Module
//!
//! Exit codes and error-to-code mapping for the broker binary

pub mod exit_codes;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};
