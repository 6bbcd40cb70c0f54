pub mod advisories;
pub mod checker;
pub mod client;
pub mod resolver;
pub mod types;
pub mod version;

#[cfg(test)]
pub mod testing;
