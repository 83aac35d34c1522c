//! Core vocabulary shared by the Molten interpreter and JIT engine.
//!
//! This crate is deliberately small: the runtime value model, the object
//! heap, and the error taxonomy. Everything trace- or compile-related lives
//! in `molten_jit`.

pub mod error;
pub mod heap;
pub mod value;

pub use error::{CodeError, VmError};
pub use heap::{Heap, HeapObject, Shape, ShapeId};
pub use value::{ObjRef, Value, ValueKind};
