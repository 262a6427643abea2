pub mod config;
pub mod lock;
pub mod semantic;

#[cfg(test)]
mod tests;
