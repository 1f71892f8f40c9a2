//! Thread model: the engine, its per-thread workers, the idle-timeout
//! manager each worker runs, and the accept loop.

pub mod engine;
pub mod listener;
pub mod timeout;
pub mod worker;
