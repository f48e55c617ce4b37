//! Test modules for the scheduler crate

mod engine_tests;
