//! # wxrelay-providers
//!
//! AI backend clients for wxrelay.

pub mod chat_api;
mod http;
pub mod openai;
pub mod sse;

pub use chat_api::ChatApiBackend;
pub use openai::OpenAiBackend;
