pub mod command;
pub mod errors;
pub mod events;
pub mod ids;
pub mod info;
