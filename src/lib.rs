//! ### English
//! `compositor_swap` crate root.
//!
//! Hands graphics buffers between a producing client and a consuming compositor without
//! ever giving one buffer to both at once. The core lives under `engine`:
//!
//! - `BufferSwapperDouble`: two buffers, one atomic state word, never blocks.
//! - `BufferSwapperMulti`: N buffers, client back-pressure, forced shutdown.
//! - `SurfaceStream`: per-surface client/compositor entry points and runtime policy switching.
//! - `Compositor`: the thread that takes each surface's newest frame once per frame.
//!
//! ### 中文
//! `compositor_swap` 的 crate 根。
//!
//! 在生产帧的客户端与消费帧的合成器之间传递图形缓冲区，且同一缓冲区绝不会同时交给双方。
//! 核心实现位于 `engine` 模块：
//!
//! - `BufferSwapperDouble`：两个缓冲区、单个原子状态字，从不阻塞。
//! - `BufferSwapperMulti`：N 个缓冲区，对客户端施加背压，支持强制关闭。
//! - `SurfaceStream`：单个 surface 的客户端/合成器入口，以及运行时缓冲策略切换。
//! - `Compositor`：每帧取一次各 surface 最新帧的合成线程。
mod engine;

pub use engine::buffer::{
    Buffer, BufferHandle, BufferId, BufferProperties, BufferUsage, GraphicBufferAllocator,
    PixelFormat,
};
pub use engine::compositor::{Compositor, CompositorInit, DisplayBackend};
pub use engine::error::{AllocationError, CompositorError, SurfaceError, SwapperError};
pub use engine::surface::{CompositorBuffer, SurfaceId, SurfaceStream};
pub use engine::swapper::{
    BufferSwapper, BufferSwapperDouble, BufferSwapperMulti, BufferingPolicy, Handover,
    SwapperFactory,
};

pub use dpi::PhysicalSize;
