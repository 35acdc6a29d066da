//! The back-end of the compiler: x86-64 System V code generation.

pub mod asm;

pub use asm::generate;
