pub mod cdc;
pub mod processor;
pub mod read;
pub mod write;
