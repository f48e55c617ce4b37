//! Test modules for the consumers crate

mod pool_tests;
