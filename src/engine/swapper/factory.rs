//! ### English
//! Builds swappers for a buffering policy, either from freshly allocated buffers or from the
//! buffers a retiring swapper handed over.
//!
//! ### 中文
//! 按缓冲策略构建交换器：使用新分配的缓冲区，或使用退役交换器移交的缓冲区。

use std::sync::Arc;

use crate::engine::buffer::{BufferHandle, BufferProperties, GraphicBufferAllocator};
use crate::engine::error::{AllocationError, SwapperError};

use super::multi::MIN_BUFFER_COUNT;
use super::{BufferSwapper, BufferSwapperDouble, BufferSwapperMulti, Handover};

/// ### English
/// How many buffers a surface uses and which swapper moves them.
///
/// ### 中文
/// surface 使用多少个缓冲区，以及由哪种交换器移交它们。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferingPolicy {
    /// ### English
    /// Two buffers, lock-free, never blocks the client (may drop unshown frames).
    ///
    /// ### 中文
    /// 两个缓冲区，无锁，从不阻塞客户端（可能丢弃未显示的帧）。
    LockFreeDouble,
    /// ### English
    /// `buffer_count` buffers with client back-pressure.
    ///
    /// ### 中文
    /// `buffer_count` 个缓冲区，对客户端施加背压。
    Multi { buffer_count: usize },
    /// ### English
    /// `buffer_count` buffers; instead of waiting, the client recycles the oldest unshown frame
    /// while a newer one is queued.
    ///
    /// ### 中文
    /// `buffer_count` 个缓冲区；客户端不等待，而是在队列中还有更新帧时回收最旧的未显示帧。
    FrameDropping { buffer_count: usize },
}

impl BufferingPolicy {
    pub const fn double_buffered() -> Self {
        BufferingPolicy::LockFreeDouble
    }

    pub const fn triple_buffered() -> Self {
        BufferingPolicy::Multi { buffer_count: 3 }
    }

    pub const fn buffer_count(self) -> usize {
        match self {
            BufferingPolicy::LockFreeDouble => 2,
            BufferingPolicy::Multi { buffer_count }
            | BufferingPolicy::FrameDropping { buffer_count } => buffer_count,
        }
    }

    pub const fn drops_frames(self) -> bool {
        matches!(self, BufferingPolicy::FrameDropping { .. })
    }
}

impl Default for BufferingPolicy {
    fn default() -> Self {
        Self::double_buffered()
    }
}

/// ### English
/// Creates swappers backed by the platform allocator.
///
/// ### 中文
/// 基于平台分配器创建交换器。
pub struct SwapperFactory {
    allocator: Arc<dyn GraphicBufferAllocator>,
}

impl SwapperFactory {
    pub fn new(allocator: Arc<dyn GraphicBufferAllocator>) -> Self {
        Self { allocator }
    }

    fn allocate(
        &self,
        properties: &BufferProperties,
        count: usize,
    ) -> Result<Vec<BufferHandle>, SwapperError> {
        (0..count)
            .map(|_| self.allocator.alloc_buffer(properties).map_err(Into::into))
            .collect()
    }

    /// ### English
    /// Allocates `policy.buffer_count()` buffers and wraps them in the matching swapper.
    ///
    /// ### 中文
    /// 分配 `policy.buffer_count()` 个缓冲区，并用对应的交换器包装。
    pub fn create_swapper(
        &self,
        properties: &BufferProperties,
        policy: BufferingPolicy,
    ) -> Result<Arc<dyn BufferSwapper>, SwapperError> {
        let count = policy.buffer_count();
        if count < MIN_BUFFER_COUNT {
            return Err(SwapperError::InvalidBufferCount { count });
        }

        if !self
            .allocator
            .supported_pixel_formats()
            .contains(&properties.format)
        {
            return Err(AllocationError::new(format!(
                "pixel format {:?} is not supported",
                properties.format
            ))
            .into());
        }

        let buffers = self.allocate(properties, count)?;
        match policy {
            BufferingPolicy::LockFreeDouble => {
                let [buffer_a, buffer_b]: [BufferHandle; 2] = buffers
                    .try_into()
                    .map_err(|rest: Vec<_>| SwapperError::InvalidBufferCount {
                        count: rest.len(),
                    })?;
                Ok(Arc::new(BufferSwapperDouble::new(buffer_a, buffer_b)))
            }
            BufferingPolicy::Multi { .. } | BufferingPolicy::FrameDropping { .. } => Ok(Arc::new(
                BufferSwapperMulti::new(buffers)?.with_frame_dropping(policy.drops_frames()),
            )),
        }
    }

    /// ### English
    /// Builds a successor swapper from buffers handed over by `end_responsibility`.
    ///
    /// - Growing allocates the missing buffers; on allocation failure the old count is kept.
    /// - Shrinking drops free buffers, oldest first, never below what the client still holds.
    /// - The lock-free double swapper needs both buffers back; with buffers outstanding a
    ///   multi swapper of the same size is built instead.
    ///
    /// #### Parameters
    /// - `properties`: Properties for any newly allocated buffers.
    /// - `buffers`: Free buffers from the predecessor, newest completed frame last.
    /// - `handover`: Outstanding buffers reported by the predecessor.
    /// - `policy`: Requested policy.
    ///
    /// ### 中文
    /// 使用 `end_responsibility` 移交的缓冲区构建后继交换器。
    ///
    /// - 扩容时分配缺少的缓冲区；分配失败则保持原数量。
    /// - 缩容时按从旧到新丢弃空闲缓冲区，且不会少于客户端仍持有的数量所需。
    /// - 无锁双缓冲交换器需要两个缓冲区都已归还；否则改为构建同等数量的多缓冲交换器。
    ///
    /// #### 参数
    /// - `properties`：新分配缓冲区使用的属性。
    /// - `buffers`：前任交换器的空闲缓冲区，最新完成的帧位于末尾。
    /// - `handover`：前任报告的未归还缓冲区。
    /// - `policy`：请求的策略。
    pub fn create_swapper_reuse_buffers(
        &self,
        properties: &BufferProperties,
        mut buffers: Vec<BufferHandle>,
        mut handover: Handover,
        policy: BufferingPolicy,
    ) -> Result<Arc<dyn BufferSwapper>, SwapperError> {
        let target = policy.buffer_count().max(MIN_BUFFER_COUNT);
        self.resize_handover(properties, &mut buffers, &mut handover, target);

        if policy == BufferingPolicy::LockFreeDouble {
            if handover.outstanding() == 0 && buffers.len() == 2 {
                let newest = buffers.pop();
                let older = buffers.pop();
                if let (Some(older), Some(newest)) = (older, newest) {
                    // The compositor starts on the newest frame; the client renders into the other.
                    return Ok(Arc::new(BufferSwapperDouble::new(older, newest)));
                }
            }
            log::warn!(
                "lock-free double buffering needs both buffers back ({} outstanding, {} free); \
                 using a multi swapper of {} buffers",
                handover.outstanding(),
                buffers.len(),
                handover.swapper_size
            );
        }

        Ok(Arc::new(
            BufferSwapperMulti::from_handover(buffers, handover)?
                .with_frame_dropping(policy.drops_frames()),
        ))
    }

    fn resize_handover(
        &self,
        properties: &BufferProperties,
        buffers: &mut Vec<BufferHandle>,
        handover: &mut Handover,
        target: usize,
    ) {
        let current = handover.swapper_size;
        if target > current {
            let mut extra = Vec::with_capacity(target - current);
            for _ in current..target {
                match self.allocator.alloc_buffer(properties) {
                    Ok(buffer) => extra.push(buffer),
                    Err(err) => {
                        log::warn!("keeping {} buffers: {err}", current + extra.len());
                        break;
                    }
                }
            }
            handover.swapper_size += extra.len();
            // Fresh buffers go to the front so the newest frame stays last.
            buffers.splice(0..0, extra);
        } else if target < current {
            let floor = target.max(handover.client_outstanding() + 1);
            let dropped = current.saturating_sub(floor).min(buffers.len());
            buffers.drain(..dropped);
            handover.swapper_size -= dropped;
        }
    }
}
