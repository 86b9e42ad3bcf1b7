//! Web front-end around yt-dlp: URL validation, metadata extraction with
//! client-profile fallback, format cataloging, and background downloads
//! with pollable progress.

pub mod catalog;
pub mod config;
pub mod error;
pub mod extractor;
pub mod http;
pub mod locate;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod validator;

#[cfg(test)]
mod testing;
