//! Core data model for the MiniScript runtime: the polymorphic value
//! lattice, the three-address-code instruction record, and error types.
#![allow(clippy::mutable_key_type)]

pub mod error;
pub mod tac;
pub mod value;

pub use error::{MiniscriptError, SourceLoc};
pub use tac::{dump, new_code, Code, Line, Op};
pub use value::{
    number_to_string, string_hash, AssignOverride, FuncDef, FuncValue, ListRc, MapKey, Param,
    SeqElem, ValMap, Value, DEFAULT_EQUALITY_DEPTH, ISA_KEY, MAX_ARG_STACK, MAX_ISA_DEPTH,
    MAX_LIST_SIZE, MAX_STRING_SIZE,
};
