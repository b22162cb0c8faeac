pub mod block;
pub mod data;
pub mod expr;
pub mod instructions;
pub mod ir_printer;
pub mod module;
pub mod node;
pub mod port;
pub mod user;
pub mod visitor;

pub use block::{Block, BlockKind};
pub use data::{Array, DataType, IntImm, RecordField, RecordLayout, StrImm, Typed};
pub use expr::{Expr, Opcode};
pub use module::{MemoryParams, Module, ModuleKind, Timing};
pub use node::{BaseNode, NodeKind};
pub use port::FIFO;
pub use user::Operand;
