//! statig-driven state machines.

pub mod install_sm;
