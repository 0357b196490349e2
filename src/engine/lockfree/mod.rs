//! ### English
//! Lock-free helpers shared across the engine.
//!
//! ### 中文
//! 引擎内复用的无锁辅助工具。
mod backoff;

pub(crate) use backoff::Backoff;
