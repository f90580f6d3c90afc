//! Authenticated retrieval of build lists, build maps and artifacts from
//! the CI server

pub mod client;
pub mod error;

pub use client::JenkinsClient;
pub use error::{JenkinsError, JenkinsResult};
