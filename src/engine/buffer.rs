//! ### English
//! Opaque buffer handles moved between the client and the compositor.
//!
//! The swapping core never reads or writes pixels; it only needs identity and geometry.
//! Allocation lives behind `GraphicBufferAllocator` (GPU/shm specifics are external).
//!
//! ### 中文
//! 在客户端与合成器之间传递的不透明缓冲区句柄。
//!
//! 交换核心从不读写像素，只关心标识与几何信息。
//! 分配由 `GraphicBufferAllocator` 负责（GPU/共享内存细节属于外部实现）。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dpi::PhysicalSize;

use super::error::AllocationError;

/// ### English
/// Process-unique buffer identity.
///
/// ### 中文
/// 进程内唯一的缓冲区标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u32);

static NEXT_BUFFER_ID: AtomicU32 = AtomicU32::new(1);

impl BufferId {
    /// ### English
    /// Returns a fresh id. `0` is never handed out.
    ///
    /// ### 中文
    /// 返回一个新的 id，`0` 不会被分配。
    pub fn new() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Default for BufferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// ### English
/// Pixel layouts a buffer may carry.
///
/// ### 中文
/// 缓冲区可能使用的像素布局。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Abgr8888,
    Xbgr8888,
    Argb8888,
    Xrgb8888,
    Bgr888,
    Rgb565,
}

impl PixelFormat {
    /// ### English
    /// Bytes used by one pixel.
    ///
    /// ### 中文
    /// 单个像素占用的字节数。
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Abgr8888
            | PixelFormat::Xbgr8888
            | PixelFormat::Argb8888
            | PixelFormat::Xrgb8888 => 4,
            PixelFormat::Bgr888 => 3,
            PixelFormat::Rgb565 => 2,
        }
    }

    pub const fn has_alpha(self) -> bool {
        matches!(self, PixelFormat::Abgr8888 | PixelFormat::Argb8888)
    }
}

/// ### English
/// Where the pixel storage is expected to live.
///
/// ### 中文
/// 像素存储的预期位置。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BufferUsage {
    #[default]
    Hardware,
    Software,
}

/// ### English
/// Request passed to the allocator when a surface's buffers are created.
///
/// ### 中文
/// 创建 surface 缓冲区时传给分配器的请求参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferProperties {
    /// ### English
    /// Buffer size in pixels.
    ///
    /// ### 中文
    /// 缓冲区尺寸（像素）。
    pub size: PhysicalSize<u32>,
    pub format: PixelFormat,
    pub usage: BufferUsage,
}

impl BufferProperties {
    pub fn new(size: PhysicalSize<u32>, format: PixelFormat, usage: BufferUsage) -> Self {
        Self {
            size,
            format,
            usage,
        }
    }

    /// ### English
    /// Tightly packed stride in bytes (allocators may pad further).
    ///
    /// ### 中文
    /// 紧凑排列时的行跨度（字节），分配器可以在此基础上额外填充。
    pub fn min_stride(&self) -> u32 {
        self.size.width.saturating_mul(self.format.bytes_per_pixel())
    }
}

/// ### English
/// Opaque pixel storage handle. Implemented by the platform layer.
///
/// ### 中文
/// 不透明的像素存储句柄，由平台层实现。
pub trait Buffer: Send + Sync {
    fn id(&self) -> BufferId;

    fn size(&self) -> PhysicalSize<u32>;

    /// ### English
    /// Row stride in bytes.
    ///
    /// ### 中文
    /// 行跨度（字节）。
    fn stride(&self) -> u32;

    fn pixel_format(&self) -> PixelFormat;
}

/// ### English
/// Shared handle to a buffer. Only handles move between owners; storage is never copied.
///
/// ### 中文
/// 缓冲区共享句柄。在所有者之间移动的只是句柄，存储本身从不复制。
pub type BufferHandle = Arc<dyn Buffer>;

/// ### English
/// Buffer factory supplied by the graphics platform.
///
/// ### 中文
/// 由图形平台提供的缓冲区工厂。
pub trait GraphicBufferAllocator: Send + Sync {
    /// ### English
    /// Allocates one buffer matching `properties`.
    ///
    /// ### 中文
    /// 分配一个符合 `properties` 的缓冲区。
    fn alloc_buffer(&self, properties: &BufferProperties) -> Result<BufferHandle, AllocationError>;

    fn supported_pixel_formats(&self) -> Vec<PixelFormat>;
}
