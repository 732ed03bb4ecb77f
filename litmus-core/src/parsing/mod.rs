//! Parsing helpers for model output and target responses
//!
//! - [`parse_json`] / [`parse_json_object`]: lenient JSON extraction from LLM
//!   replies (code fences, surrounding prose, single quotes, trailing commas)
//! - [`filter_json`] / [`output_text`]: select the answer out of a target
//!   response with comma-separated dot paths such as `data.items[0].text`
//! - [`strip_references`]: drop citation markers like `[3]` before judging

mod json;
mod paths;

pub use json::{parse_json, parse_json_object};
pub use paths::{filter_json, output_text, strip_references, value_to_text};

use thiserror::Error;

/// Error type for parsing operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Nothing to parse
    #[error("Empty input")]
    EmptyInput,

    /// No JSON could be recovered, even after repair
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Parsed JSON was not the expected shape
    #[error("Expected a JSON object, got {0}")]
    NotAnObject(String),
}

/// Result type for parsing operations
pub type ParseResult<T> = Result<T, ParseError>;
