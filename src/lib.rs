// GEEPAFS -- PERFORMANCE-ASSURED, ENERGY-EFFICIENT GPU CLOCK CONTROL
//
// LIBRARY TARGET: EVERY COMPONENT OF THE CONTROLLER, SHARED BY THE BINARY
// (main.rs) AND THE OFFLINE TESTS (tests/). NOTHING HERE NEEDS A GPU.

pub mod adaptive;
pub mod cli;
pub mod config;
pub mod event;
pub mod gpu;
pub mod model;
pub mod policy;
pub mod probe;
pub mod regression;
pub mod select;
pub mod sim;
pub mod smoothing;
pub mod tuning;
