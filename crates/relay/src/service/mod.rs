pub mod coordinator;
pub mod status;
