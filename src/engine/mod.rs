/// ### English
/// Engine internal modules (buffers, swappers, surface streams, and the compositor thread).
///
/// ### 中文
/// 引擎内部模块（缓冲区、交换器、surface 流以及合成线程）。
pub mod buffer;
pub(crate) mod cache;
pub mod compositor;
pub mod error;
pub(crate) mod lockfree;
pub mod surface;
pub mod swapper;
