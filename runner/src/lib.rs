pub mod balance;
pub mod campaign;
pub mod checkpoint;
pub mod manifest;
pub mod render;
pub mod scheduler;
pub mod status;
