#[macro_use]
mod json;

mod sdam;
mod server_selection;
