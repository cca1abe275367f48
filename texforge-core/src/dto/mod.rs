//! Data Transfer Objects for the compile API
//!
//! Wire-level shapes exchanged with callers. Binary payloads (dependency
//! files, the compiled artifact) travel base64-encoded; DTO conversion is
//! where encoding and decoding happen, so the domain types stay binary.

pub mod compile;
