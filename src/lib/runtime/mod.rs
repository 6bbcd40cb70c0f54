pub mod bulk;
pub mod docker;
pub mod gateway;
pub mod pool;
pub mod types;

#[cfg(test)]
pub mod testing;
