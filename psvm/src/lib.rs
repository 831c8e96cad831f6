mod arena;
mod collector;
mod composite;
mod config;
mod context;
mod entity;
mod error;
mod freelist;
mod memory;
mod names;
mod object;
mod operator;
mod ops;
mod resource;
mod save;
mod scheduler;
mod stack;
mod system;
mod vm;

pub use arena::*;
pub use collector::*;
pub use config::*;
pub use context::*;
pub use entity::*;
pub use error::*;
pub use freelist::*;
pub use memory::*;
pub use names::*;
pub use object::*;
pub use operator::*;
pub use ops::{OPERATORS, OperatorDef};
pub use resource::*;
pub use save::*;
pub use scheduler::*;
pub use stack::*;
pub use system::OS_PAGE_SIZE;
pub use vm::*;
