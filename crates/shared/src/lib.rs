pub mod domain;
pub mod error;
pub mod protocol;
pub mod stream;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
