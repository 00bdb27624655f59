use thiserror::Error;

/// Returned by [`Parser::set_language`] when a language table was generated
/// for a table-format version this runtime cannot drive.
///
/// Parsing itself never fails: lexical and syntactic problems are recorded
/// inside the produced tree as `ERROR` and `MISSING` nodes.
///
/// [`Parser::set_language`]: crate::Parser::set_language
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error(
    "language table version {version} is not compatible with this runtime \
     (supported: {minimum}..={maximum})"
)]
pub struct IncompatibleLanguageError {
    pub version: u32,
    pub minimum: u32,
    pub maximum: u32,
}
