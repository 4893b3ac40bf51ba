pub mod agent;
pub mod hub;
pub mod version;
