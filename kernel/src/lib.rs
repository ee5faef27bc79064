// Rebuild Kernel
//
// Transaction log reading, a reference store, and the replay engine
// that rebuilds one store from the logs of another.

pub mod check;
pub mod config;
pub mod log;
pub mod rebuild;
pub mod store;
