//! ciak: a render bridge for machine-generated animation scenes.
//!
//! A submission travels repair → validate → render → locate, with progress
//! streamed back to the caller as newline-delimited JSON until the single
//! terminal event. When the render toolchain is absent the job still
//! completes, carrying a mock preview artifact instead of a video.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
