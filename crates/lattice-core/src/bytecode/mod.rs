//! bytecode — format de chunk et catalogue d'instructions (C3).

pub mod chunk;
pub mod op;

pub use chunk::{Chunk, ChunkFlags, ChunkLoadError, ConstPool, ConstValue, DebugInfo, LineTable, UpvalueDesc};
pub use op::{ConstIx, FuncIx, LocalIx, Op, OperandKind, ParamPhase, UpvalueIx, MAX_ARGC};
