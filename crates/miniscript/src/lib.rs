//! MiniScript: an embeddable scripting language runtime.
//!
//! Source text is compiled to three-address code and evaluated by a
//! stepping virtual machine with cooperative time-slicing.  The
//! [`Interpreter`] is the main entry point for hosts; see the
//! `miniscript` binary for a command-line front end.

mod interpreter;

pub use interpreter::Interpreter;

pub use miniscript_core::{
    number_to_string, MiniscriptError, SourceLoc, ValMap, Value,
};
pub use miniscript_lexer::{Lexer, Token, TokenType};
pub use miniscript_parser::Parser;
pub use miniscript_vm::{
    set_host_info, Intrinsic, IntrinsicResult, Machine, TextOutput,
};
