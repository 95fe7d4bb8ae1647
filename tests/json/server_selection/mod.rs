pub mod read_preference;
pub mod reader;
pub mod server;
