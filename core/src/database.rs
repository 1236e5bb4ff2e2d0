pub mod filter;
#[cfg(test)]
pub(crate) mod memory;
pub mod postgres;
pub mod statement;
pub mod store;
pub mod value;
