//! ### English
//! Cache-line padding helpers for contended atomics (the double swapper's state word).
//!
//! ### 中文
//! 争用原子量（双缓冲交换器的状态字）使用的 cache line 填充工具。

/// ### English
/// The cache line size we optimize for (bytes).
///
/// ### 中文
/// 作为优化目标的 cache line 大小（字节）。
pub(crate) const CACHE_LINE_BYTES: usize = 64;

/// ### English
/// Returns the padding bytes needed to advance to the next cache-line boundary.
///
/// #### Parameters
/// - `bytes_used`: Number of bytes already occupied by preceding fields.
///
/// ### 中文
/// 返回将偏移推进到下一个 cache line 边界所需的 padding 字节数。
///
/// #### 参数
/// - `bytes_used`：前置字段已占用的字节数。
#[inline]
pub(crate) const fn pad_to_cache_line(bytes_used: usize) -> usize {
    let rem = bytes_used % CACHE_LINE_BYTES;
    if rem == 0 { 0 } else { CACHE_LINE_BYTES - rem }
}

/// ### English
/// Padding after a single field of type `T`, so that the field owns its cache line.
///
/// ### 中文
/// 单个 `T` 字段之后所需的 padding，使该字段独占一个 cache line。
#[inline]
pub(crate) const fn pad_after<T>() -> usize {
    pad_to_cache_line(std::mem::size_of::<T>())
}
