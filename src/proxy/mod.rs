pub mod debug;
pub mod headers;
pub mod pool;
pub mod router;
pub mod server;
pub mod upstream;

#[cfg(test)]
mod tests;
