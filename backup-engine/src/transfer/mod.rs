pub mod hashing_stream;
pub mod progress;
