//! A user-space virtual machine for 64-bit eBPF programs.
//!
//! Programs arrive either as raw instruction bytes or as a relocatable
//! object image, are checked by a structural verifier, and then run in the
//! interpreter or as native x86-64 code produced by the built-in JIT.
//! Host code participates through registered helper functions, an optional
//! external dispatcher, a data-relocation callback for host-managed
//! tables, and a bounds-check callback policing every program load and
//! store outside the program's private stack.
//!
//! ## Example
//!
//! ```
//! use bpfvm::{ebpf, Vm};
//!
//! // mov r0, 5; add r0, 7 (64-bit); exit
//! let prog = [
//!     ebpf::Insn { opcode: ebpf::MOV64_IMM, dst: 0, imm: 5, ..Default::default() }.write(),
//!     ebpf::Insn { opcode: ebpf::ADD64_IMM, dst: 0, imm: 7, ..Default::default() }.write(),
//!     ebpf::Insn { opcode: ebpf::EXIT, ..Default::default() }.write(),
//! ]
//! .concat();
//!
//! let mut vm = Vm::new();
//! vm.load(&prog).unwrap();
//! assert_eq!(vm.execute(&mut []).unwrap(), 12);
//! ```
//!
//! A given `Vm` must not be mutated concurrently; once compiled, the
//! returned function may be called from multiple threads provided the
//! registered helpers are reentrant.

pub mod ebpf;
pub mod elf;
pub mod pod;

mod error;
mod interp;
mod jit;
mod loader;
mod verifier;
mod vm;

pub use error::{Error, Result};
pub use vm::{Dispatcher, Helper, JitFn, Validator, Vm};

/// Maximum number of instructions a program can contain.
pub const MAX_INSNS: usize = 65536;

/// Size in bytes of the private stack. Divisible by 16.
pub const STACK_SIZE: usize = 512;

/// Maximum depth of nested local calls.
pub const MAX_CALL_DEPTH: usize = 10;

/// Number of helper slots addressable by `call` immediates.
pub const MAX_HELPERS: u32 = 8192;
