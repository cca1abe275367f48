//! TexForge Core
//!
//! Core types for the TexForge LaTeX compilation service.
//!
//! This crate contains:
//! - Domain types: Job lifecycle entities (Job, JobStatus, CompileResult)
//! - DTOs: Wire-level request/response shapes for the compile API

pub mod domain;
pub mod dto;
