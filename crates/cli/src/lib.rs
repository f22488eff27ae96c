//! Launch, configure, stop and destroy short-lived EC2 clusters.

pub mod bootstrap;
pub mod bulk_copy;
pub mod capacity;
pub mod config;
pub mod controller;
pub mod fanout;
pub mod info;
pub mod prompt;
pub mod remote;
pub mod resolver;
pub mod spinner;
pub mod ssh;
pub mod waiter;

pub use controller::{ClusterState, Controller, StopReport};
