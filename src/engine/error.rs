//! ### English
//! Error types for swappers, surface streams and the compositor thread.
//!
//! ### 中文
//! 交换器、surface 流以及合成线程的错误类型。

use std::io;

use thiserror::Error;

use super::buffer::BufferId;

/// ### English
/// Failure reported by the platform allocator.
///
/// ### 中文
/// 平台分配器报告的失败。
#[derive(Debug, Error)]
#[error("buffer allocation failed: {reason}")]
pub struct AllocationError {
    pub reason: String,
}

impl AllocationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// ### English
/// Runtime conditions and logic errors reported by a `BufferSwapper`.
///
/// ### 中文
/// `BufferSwapper` 报告的运行时状态与逻辑错误。
#[derive(Debug, Error)]
pub enum SwapperError {
    /// ### English
    /// Forced completion was requested; the client must stop requesting buffers.
    ///
    /// ### 中文
    /// 已请求强制完成；客户端应停止请求缓冲区。
    #[error("forced completion: no buffer will be handed to the client")]
    ForcedCompletion,
    #[error("a swapper needs at least 2 buffers, got {count}")]
    InvalidBufferCount { count: usize },
    /// ### English
    /// Both queues were empty when the compositor asked for a frame.
    ///
    /// ### 中文
    /// 合成器请求帧时两个队列均为空。
    #[error("no buffer available for the compositor")]
    NoBufferForCompositor,
    /// ### English
    /// A buffer was released by a side that does not own it.
    ///
    /// ### 中文
    /// 某一侧释放了并不属于它的缓冲区。
    #[error("{id} released without being owned by the releasing side")]
    UnexpectedRelease { id: BufferId },
    #[error("handover left {outstanding} buffer(s) outstanding")]
    HandoverIncomplete { outstanding: usize },
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

/// ### English
/// Errors seen by users of a `SurfaceStream`.
///
/// ### 中文
/// `SurfaceStream` 使用者可见的错误。
#[derive(Debug, Error)]
pub enum SurfaceError {
    /// ### English
    /// The surface is being destroyed; stop requesting buffers.
    ///
    /// ### 中文
    /// surface 正在销毁；应停止请求缓冲区。
    #[error("surface is closed")]
    Closed,
    #[error("the client has not acquired a buffer yet")]
    NoClientBuffer,
    #[error(transparent)]
    Swapper(#[from] SwapperError),
}

#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("failed to spawn compositor thread: {0}")]
    Spawn(#[from] io::Error),
    #[error("compositor thread has stopped")]
    Stopped,
}
