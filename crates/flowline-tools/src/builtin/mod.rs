pub mod data;
pub mod functions;
