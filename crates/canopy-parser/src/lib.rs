#![doc = include_str!("../README.md")]

mod error;
mod input;
mod language;
mod length;
mod lexer;
mod parser;
mod reuse;
mod stack;
mod subtree;
mod tree;

#[cfg(test)]
mod tests;

pub use crate::error::IncompatibleLanguageError;
pub use crate::input::{Input, StrInput};
pub use crate::language::{
    ExternalScanner, ExternalTokens, Language, LanguageRef, LexMode, ParseAction, ParseTableEntry,
    StateId, SymbolId, SymbolMetadata, ERROR_STATE, LANGUAGE_VERSION,
    MIN_COMPATIBLE_LANGUAGE_VERSION, SERIALIZATION_BUFFER_SIZE, START_STATE, SYM_END, SYM_ERROR,
    SYM_ERROR_REPEAT,
};
pub use crate::lexer::LexCursor;
pub use crate::length::Length;
pub use crate::parser::{LogKind, Logger, Parser};
pub use crate::tree::{InputEdit, Tree};
