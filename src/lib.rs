pub mod agent_runner;
pub mod blocked_propagator;
pub mod cancellation;
pub mod config;
pub mod controller;
pub mod dependency_graph;
pub mod errors;
pub mod forge_client;
pub mod handoff;
pub mod iteration_driver;
pub mod phase;
pub mod signals;
pub mod stream;
pub mod task_queue;
pub mod util;
