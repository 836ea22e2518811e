pub mod errors;
pub mod ids;
pub mod messages;
pub mod security;
pub mod transport;
