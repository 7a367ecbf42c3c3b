pub mod normalize;
pub mod token;
pub mod tokenizer;

pub use normalize::{CanonicalizeError, canonicalize};
pub use token::{Span, Token, TokenKind};
pub use tokenizer::{LexResult, LexerError, tokenize};
