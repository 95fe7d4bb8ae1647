pub mod outcome;
pub mod reader;
pub mod responses;
