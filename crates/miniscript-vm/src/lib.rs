//! The MiniScript virtual machine: call contexts, the per-opcode TAC
//! evaluator, the stepping machine, and the built-in intrinsics.

pub mod context;
pub mod eval;
pub mod intrinsics;
pub mod machine;
pub mod resolve;

pub use context::Context;
pub use intrinsics::{
    add_short_name, compile_slice, host_info, set_host_info, HostInfo, Intrinsic,
    IntrinsicBuilder, IntrinsicResult,
};
pub use machine::{default_output, Machine, MachineShared, TextOutput};
