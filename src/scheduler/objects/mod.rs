//! The objects the scheduler accounts with

pub mod allocation;
pub mod application;
pub mod node;
pub mod queue;

pub use allocation::{Allocation, AllocationResult, TerminationReason};
pub use application::{AllocationAsk, Application, ApplicationState, Reservation};
pub use node::{Node, NodeReservation};
pub use queue::Queue;
