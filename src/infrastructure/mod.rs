#[cfg(test)]
pub mod memory;
pub mod nats;
pub mod postgres;
