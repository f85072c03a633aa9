pub mod embedding;
pub mod error;
pub mod ollama;
pub mod redis;
pub mod vectordb;
