//! Tokenizer for MiniScript source text.

mod lexer;
mod token;

pub use lexer::Lexer;
pub use token::{is_keyword, Token, TokenType, KEYWORDS};
