//! The middle of the compiler: semantic analysis and the typed tree it
//! produces for the backend to walk.

pub mod sem;
pub mod tir;

pub use sem::lower;
