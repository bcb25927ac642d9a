//! Simulated radio and peripherals, used by the test suites and by `--simulate`.

pub mod panel;
pub mod radio;
