//! The allocation phases, in pipeline order.

pub mod build;
pub mod cleanup;
pub mod liveness;
pub mod loops;
pub mod number;
pub mod order;
pub mod prologue;
pub mod resolve;
pub mod verify;
pub mod walk;
