//! Data structures modified for the needs of the solver.

pub mod arena;
pub mod pool;

pub use arena::{Arena, Index};
pub use pool::{MemoryPool, PoolHandle};
