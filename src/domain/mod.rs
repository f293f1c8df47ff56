pub mod models;
pub mod opcode;
pub mod settings;
