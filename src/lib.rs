pub mod admin;
pub mod app;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod registry;
pub mod toolcalls;
pub mod upstream;
pub mod usage;
pub mod users;
