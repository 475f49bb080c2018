use thiserror::Error;

/// Malformed line in a mapping file or filter configuration. Always recovered by
/// skipping the offending line or block.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum ParseError {
    #[error("line {line}: malformed mapping entry `{raw}`")]
    MappingLine { line: usize, raw: String },
    #[error("line {line}: {msg} in `{raw}`")]
    Directive { line: usize, msg: String, raw: String },
    #[error("malformed method descriptor `{0}`")]
    Descriptor(String),
}

/// Contradictory filter configuration. Aborts the run before any class is processed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum ConfigConsistencyError {
    #[error("block package `{block}` is not inside any allow package ({allowed})")]
    BlockOutsideAllow { block: String, allowed: String },
    #[error("block package `{0}` is identical to an allow package")]
    BlockEqualsAllow(String),
}

/// Failure while rewriting a single class. The caller copies the original bytes through.
#[derive(Debug, Error)]
pub(crate) enum RewriteError {
    #[error("not a class file (bad magic 0x{0:08x})")]
    BadMagic(u32),
    #[error("truncated class file at byte {0}")]
    Truncated(usize),
    #[error("invalid constant pool reference #{0}")]
    BadConstant(u16),
    #[error("unknown constant pool tag {tag} at #{index}")]
    UnknownConstantTag { tag: u8, index: usize },
    #[error("constant pool overflow")]
    ConstantPoolOverflow,
    #[error("malformed bytecode in {method}: {msg}")]
    Bytecode { method: String, msg: String },
    #[error("malformed stack map frame in {method}: {msg}")]
    StackMap { method: String, msg: String },
    #[error("branch offset overflow in {0}")]
    BranchOverflow(String),
    #[error("code too large in {0}")]
    CodeTooLarge(String),
    #[error("malformed descriptor: {0}")]
    Descriptor(#[from] ParseError),
}
