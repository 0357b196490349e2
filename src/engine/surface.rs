//! ### English
//! Per-surface frame submission on top of a `BufferSwapper`.
//!
//! The client side calls `advance_client_buffer` for each "next buffer" request; the compositor
//! locks the newest frame once per composition pass. The swapper can be replaced at runtime
//! (`set_buffering`) without losing a buffer, including buffers either side holds at that moment.
//!
//! ### 中文
//! 基于 `BufferSwapper` 的单个 surface 帧提交。
//!
//! 客户端在每次“下一个缓冲区”请求时调用 `advance_client_buffer`；合成器在每次合成时锁定最新帧。
//! 交换器可以在运行时替换（`set_buffering`），不会丢失任何缓冲区，包括此刻被任一侧持有的缓冲区。

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use super::buffer::{Buffer, BufferHandle, BufferProperties};
use super::error::{SurfaceError, SwapperError};
use super::swapper::{BufferSwapper, BufferingPolicy, SwapperFactory};

/// ### English
/// Process-unique surface identity.
///
/// ### 中文
/// 进程内唯一的 surface 标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u32);

static NEXT_SURFACE_ID: AtomicU32 = AtomicU32::new(1);

impl SurfaceId {
    pub fn new() -> Self {
        Self(NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Default for SurfaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

/// ### English
/// The swapper currently in charge, tagged with how many times it has been replaced.
///
/// ### 中文
/// 当前负责的交换器，附带其被替换的次数。
struct ActiveSwapper {
    generation: u64,
    swapper: Arc<dyn BufferSwapper>,
    policy: BufferingPolicy,
}

impl ActiveSwapper {
    /// ### English
    /// Lock-free double buffering was requested but buffers were outstanding at the switch,
    /// so a multi swapper stands in until they all come back.
    ///
    /// ### 中文
    /// 请求了无锁双缓冲，但切换时仍有缓冲区未归还，因此暂由多缓冲交换器代替，直到全部归还。
    fn awaiting_lock_free(&self) -> bool {
        self.policy == BufferingPolicy::LockFreeDouble && !self.swapper.lock_free()
    }
}

/// ### English
/// Frame submission endpoint of one surface.
///
/// Shared by `Arc` between the client-facing handler and the compositor.
///
/// ### 中文
/// 单个 surface 的帧提交端点。
///
/// 通过 `Arc` 在面向客户端的处理器与合成器之间共享。
pub struct SurfaceStream {
    id: SurfaceId,
    properties: BufferProperties,
    factory: Arc<SwapperFactory>,
    /// ### English
    /// Read-locked by releases and compositor acquires, write-locked only while replacing the
    /// swapper. Blocking client acquires run on a cloned `Arc` without holding it.
    ///
    /// ### 中文
    /// 释放操作与合成器 acquire 持读锁，仅在替换交换器时持写锁。
    /// 阻塞的客户端 acquire 在克隆出的 `Arc` 上执行，不持有该锁。
    active: RwLock<ActiveSwapper>,
    /// ### English
    /// Buffer the client is currently rendering into.
    ///
    /// ### 中文
    /// 客户端当前正在渲染的缓冲区。
    client_buffer: Mutex<Option<BufferHandle>>,
    closed: AtomicBool,
}

impl SurfaceStream {
    /// ### English
    /// Creates a stream and its initial swapper.
    ///
    /// #### Parameters
    /// - `properties`: Geometry and format of the surface's buffers.
    /// - `policy`: Initial buffering policy.
    /// - `factory`: Allocates buffers and builds swappers (also used by `set_buffering`).
    ///
    /// ### 中文
    /// 创建流及其初始交换器。
    ///
    /// #### 参数
    /// - `properties`：surface 缓冲区的几何尺寸与格式。
    /// - `policy`：初始缓冲策略。
    /// - `factory`：分配缓冲区并构建交换器（`set_buffering` 同样使用）。
    pub fn new(
        properties: BufferProperties,
        policy: BufferingPolicy,
        factory: Arc<SwapperFactory>,
    ) -> Result<Self, SurfaceError> {
        let swapper = factory.create_swapper(&properties, policy)?;
        let id = SurfaceId::new();
        log::debug!("{id} created: {policy:?} {properties:?}");

        Ok(Self {
            id,
            properties,
            factory,
            active: RwLock::new(ActiveSwapper {
                generation: 0,
                swapper,
                policy,
            }),
            client_buffer: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn properties(&self) -> &BufferProperties {
        &self.properties
    }

    pub fn buffering(&self) -> BufferingPolicy {
        self.active().policy
    }

    /// ### English
    /// Number of buffers the current swapper cycles through.
    ///
    /// ### 中文
    /// 当前交换器轮转的缓冲区数量。
    pub fn buffer_count(&self) -> usize {
        self.active().swapper.swapper_size()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    fn active(&self) -> RwLockReadGuard<'_, ActiveSwapper> {
        self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn client_slot(&self) -> MutexGuard<'_, Option<BufferHandle>> {
        self.client_buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> (u64, Arc<dyn BufferSwapper>) {
        let active = self.active();
        (active.generation, active.swapper.clone())
    }

    /// ### English
    /// Submits the client's current buffer (if any) and returns the next one to render into.
    ///
    /// May block while every spare buffer is queued for display. Fails with
    /// `SurfaceError::Closed` once the stream is being torn down. If the swapper rejects the
    /// submitted buffer, the client keeps it and the error is returned.
    ///
    /// ### 中文
    /// 提交客户端当前的缓冲区（如有），并返回下一个用于渲染的缓冲区。
    ///
    /// 当所有空闲缓冲区都在等待显示时可能阻塞。流进入销毁流程后返回 `SurfaceError::Closed`。
    /// 若交换器拒绝提交的缓冲区，客户端继续持有它并返回该错误。
    pub fn advance_client_buffer(&self) -> Result<BufferHandle, SurfaceError> {
        if self.is_closed() {
            return Err(SurfaceError::Closed);
        }

        let previous = self.client_slot().take();
        if let Some(buffer) = previous {
            let released = self.active().swapper.client_release(buffer.clone());
            if let Err(err) = released {
                *self.client_slot() = Some(buffer);
                return Err(err.into());
            }
        }
        self.restore_lock_free()?;

        let next = self.acquire_client_buffer()?;
        *self.client_slot() = Some(next.clone());
        Ok(next)
    }

    /// ### English
    /// Moves a stand-in multi swapper back to lock-free double buffering once no buffer is out.
    ///
    /// ### 中文
    /// 当没有缓冲区在外时，把代替用的多缓冲交换器切回无锁双缓冲。
    fn restore_lock_free(&self) -> Result<(), SurfaceError> {
        if !self.active().awaiting_lock_free() {
            return Ok(());
        }

        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed()
            || !active.awaiting_lock_free()
            || active.swapper.buffers_outstanding() != 0
        {
            return Ok(());
        }
        log::debug!("{}: every buffer is back, restoring lock-free swapper", self.id);
        self.replace_swapper(&mut active, BufferingPolicy::LockFreeDouble)
    }

    fn acquire_client_buffer(&self) -> Result<BufferHandle, SurfaceError> {
        loop {
            let (generation, swapper) = self.snapshot();
            match swapper.client_acquire() {
                Ok(buffer) => {
                    log::trace!("{}: client acquired {}", self.id, buffer.id());
                    return Ok(buffer);
                }
                Err(SwapperError::ForcedCompletion) => {
                    if self.is_closed() {
                        return Err(SurfaceError::Closed);
                    }
                    // Replacement holds the write lock, so a fresh snapshot sees the successor.
                    if self.active().generation == generation {
                        return Err(SurfaceError::Closed);
                    }
                    log::debug!("{}: swapper replaced while acquiring, retrying", self.id);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// ### English
    /// The buffer the client is currently rendering into (read-only inspection, e.g. screenshots).
    ///
    /// ### 中文
    /// 客户端当前正在渲染的缓冲区（只读查看，例如截图）。
    pub fn client_buffer(&self) -> Result<BufferHandle, SurfaceError> {
        self.client_slot().clone().ok_or(SurfaceError::NoClientBuffer)
    }

    /// ### English
    /// Takes the newest completed frame for one composition pass. Never blocks.
    /// The frame returns to the swapper when the guard is dropped.
    ///
    /// ### 中文
    /// 为一次合成取得最新的已完成帧，从不阻塞。guard 被 drop 时帧归还给交换器。
    pub fn lock_compositor_buffer(&self) -> Result<CompositorBuffer<'_>, SurfaceError> {
        let buffer = self.active().swapper.compositor_acquire()?;
        log::trace!("{}: compositor acquired {}", self.id, buffer.id());
        Ok(CompositorBuffer {
            stream: self,
            buffer,
        })
    }

    /// ### English
    /// Runs `f` with the newest completed frame, releasing it afterwards.
    ///
    /// ### 中文
    /// 使用最新的已完成帧执行 `f`，之后将其释放。
    pub fn with_compositor_buffer<R>(
        &self,
        f: impl FnOnce(&dyn Buffer) -> R,
    ) -> Result<R, SurfaceError> {
        let buffer = self.lock_compositor_buffer()?;
        Ok(f(&*buffer))
    }

    fn release_compositor_buffer(&self, buffer: BufferHandle) -> Result<(), SwapperError> {
        self.active().swapper.compositor_release(buffer)
    }

    /// ### English
    /// Switches the buffering policy, handing every buffer over to a new swapper.
    ///
    /// A client blocked in the old swapper wakes up and continues on the new one. Buffers either
    /// side holds during the switch are released into the new swapper later. If the new swapper
    /// cannot be built the stream is closed. A double request made while buffers are out runs on
    /// a multi swapper until the next submit finds every buffer back.
    ///
    /// #### Parameters
    /// - `policy`: New buffering policy.
    ///
    /// ### 中文
    /// 切换缓冲策略，将所有缓冲区移交给新的交换器。
    ///
    /// 阻塞在旧交换器上的客户端会被唤醒并在新交换器上继续。切换期间被任一侧持有的缓冲区，
    /// 之后会释放到新交换器。若无法构建新交换器，流将被关闭。缓冲区未全部归还时请求的双缓冲，
    /// 会先由多缓冲交换器运行，直到某次提交时所有缓冲区都已归还。
    ///
    /// #### 参数
    /// - `policy`：新的缓冲策略。
    pub fn set_buffering(&self, policy: BufferingPolicy) -> Result<(), SurfaceError> {
        if self.is_closed() {
            return Err(SurfaceError::Closed);
        }

        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if active.policy == policy && !active.awaiting_lock_free() {
            return Ok(());
        }
        self.replace_swapper(&mut active, policy)
    }

    fn replace_swapper(
        &self,
        active: &mut ActiveSwapper,
        policy: BufferingPolicy,
    ) -> Result<(), SurfaceError> {
        let mut buffers = Vec::with_capacity(active.swapper.swapper_size());
        let handover = active.swapper.end_responsibility(&mut buffers);
        log::debug!(
            "{}: switching {:?} -> {policy:?}, handover {handover:?}",
            self.id,
            active.policy
        );

        match self
            .factory
            .create_swapper_reuse_buffers(&self.properties, buffers, handover, policy)
        {
            Ok(swapper) => {
                active.swapper = swapper;
                active.policy = policy;
                active.generation += 1;
                Ok(())
            }
            Err(err) => {
                log::error!("{}: cannot rebuild swapper, closing: {err}", self.id);
                self.closed.store(true, Ordering::Release);
                Err(err.into())
            }
        }
    }

    /// ### English
    /// Irreversibly fails blocked and future client requests with `SurfaceError::Closed`.
    ///
    /// ### 中文
    /// 不可逆地让阻塞中及后续的客户端请求以 `SurfaceError::Closed` 失败。
    pub fn force_requests_to_complete(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("{}: forcing client requests to complete", self.id);
        }
        self.active().swapper.force_client_completion();
    }
}

impl Drop for SurfaceStream {
    fn drop(&mut self) {
        self.force_requests_to_complete();
    }
}

/// ### English
/// A frame held by the compositor. Derefs to the buffer; released on drop.
///
/// ### 中文
/// 合成器持有的帧。可解引用为缓冲区；drop 时释放。
pub struct CompositorBuffer<'a> {
    stream: &'a SurfaceStream,
    buffer: BufferHandle,
}

impl CompositorBuffer<'_> {
    pub fn handle(&self) -> &BufferHandle {
        &self.buffer
    }
}

impl Deref for CompositorBuffer<'_> {
    type Target = dyn Buffer;

    fn deref(&self) -> &Self::Target {
        &*self.buffer
    }
}

impl Drop for CompositorBuffer<'_> {
    fn drop(&mut self) {
        let id = self.buffer.id();
        if let Err(err) = self.stream.release_compositor_buffer(self.buffer.clone()) {
            log::error!("{}: compositor release of {id} failed: {err}", self.stream.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel as channel;

    use super::*;
    use crate::engine::buffer::BufferId;
    use crate::engine::swapper::test_support::{StubAllocator, properties};

    fn stream(policy: BufferingPolicy) -> Arc<SurfaceStream> {
        let factory = Arc::new(SwapperFactory::new(Arc::new(StubAllocator::default())));
        Arc::new(SurfaceStream::new(properties(), policy, factory).unwrap())
    }

    fn spawn_advance(
        stream: &Arc<SurfaceStream>,
    ) -> channel::Receiver<Result<BufferId, String>> {
        let (tx, rx) = channel::bounded(1);
        let stream = Arc::clone(stream);
        thread::spawn(move || {
            let result = stream
                .advance_client_buffer()
                .map(|buffer| buffer.id())
                .map_err(|err| err.to_string());
            let _ = tx.send(result);
        });
        rx
    }

    #[test]
    fn client_buffer_before_first_advance() {
        let stream = stream(BufferingPolicy::triple_buffered());
        assert!(matches!(
            stream.client_buffer(),
            Err(SurfaceError::NoClientBuffer)
        ));

        let buffer = stream.advance_client_buffer().unwrap();
        assert_eq!(stream.client_buffer().unwrap().id(), buffer.id());
    }

    #[test]
    fn compositor_sees_submitted_frame() {
        for policy in [
            BufferingPolicy::double_buffered(),
            BufferingPolicy::triple_buffered(),
        ] {
            let stream = stream(policy);
            let rendered = stream.advance_client_buffer().unwrap().id();
            stream.advance_client_buffer().unwrap();

            let shown = stream.with_compositor_buffer(|buffer| buffer.id()).unwrap();
            assert_eq!(shown, rendered, "{policy:?}");
        }
    }

    #[test]
    fn client_and_compositor_never_share() {
        let stream = stream(BufferingPolicy::double_buffered());
        for _ in 0..16 {
            let client = stream.advance_client_buffer().unwrap().id();
            let frame = stream.lock_compositor_buffer().unwrap();
            assert_ne!(frame.id(), client);
            assert_eq!(frame.size(), properties().size);
        }
    }

    #[test]
    fn forced_completion_unblocks_client() {
        let stream = stream(BufferingPolicy::Multi { buffer_count: 2 });
        stream.advance_client_buffer().unwrap();
        stream.advance_client_buffer().unwrap();

        let pending = spawn_advance(&stream);
        assert!(pending.recv_timeout(Duration::from_millis(50)).is_err());

        stream.force_requests_to_complete();
        let result = pending.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.is_err());
        assert!(matches!(
            stream.advance_client_buffer(),
            Err(SurfaceError::Closed)
        ));
        assert!(matches!(
            stream.set_buffering(BufferingPolicy::triple_buffered()),
            Err(SurfaceError::Closed)
        ));
    }

    #[test]
    fn switching_moves_blocked_client_to_new_swapper() {
        let stream = stream(BufferingPolicy::Multi { buffer_count: 2 });
        stream.advance_client_buffer().unwrap();
        stream.advance_client_buffer().unwrap();

        // Both frames wait for the compositor, so the next advance blocks.
        let pending = spawn_advance(&stream);
        assert!(pending.recv_timeout(Duration::from_millis(50)).is_err());

        stream
            .set_buffering(BufferingPolicy::Multi { buffer_count: 4 })
            .unwrap();
        let result = pending.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.is_ok());
        assert_eq!(stream.buffer_count(), 4);
        assert!(!stream.is_closed());
    }

    #[test]
    fn switching_keeps_held_frames_valid() {
        let stream = stream(BufferingPolicy::triple_buffered());
        stream.advance_client_buffer().unwrap();
        stream.advance_client_buffer().unwrap();

        {
            let frame = stream.lock_compositor_buffer().unwrap();
            stream
                .set_buffering(BufferingPolicy::Multi { buffer_count: 5 })
                .unwrap();
            assert_eq!(frame.pixel_format(), properties().format);
        }
        assert_eq!(stream.buffering(), BufferingPolicy::Multi { buffer_count: 5 });

        // Client release of the buffer held across the switch goes to the new swapper.
        for _ in 0..8 {
            stream.advance_client_buffer().unwrap();
            stream.with_compositor_buffer(|_| ()).unwrap();
        }
    }

    #[test]
    fn switching_to_double_after_handover() {
        let stream = stream(BufferingPolicy::triple_buffered());
        stream.advance_client_buffer().unwrap();

        // The client still holds a buffer, so the double policy degrades to a multi swapper.
        stream
            .set_buffering(BufferingPolicy::double_buffered())
            .unwrap();
        assert_eq!(stream.buffer_count(), 2);
        for _ in 0..4 {
            let client = stream.advance_client_buffer().unwrap().id();
            let shown = stream.with_compositor_buffer(|buffer| buffer.id()).unwrap();
            assert_ne!(client, shown);
        }
    }

    #[test]
    fn same_policy_is_a_no_op() {
        let stream = stream(BufferingPolicy::triple_buffered());
        let before = stream.advance_client_buffer().unwrap().id();
        stream
            .set_buffering(BufferingPolicy::triple_buffered())
            .unwrap();
        assert_eq!(stream.client_buffer().unwrap().id(), before);
        assert_eq!(stream.buffer_count(), 3);
    }

    #[test]
    fn repeated_double_request_ends_up_lock_free() {
        let stream = stream(BufferingPolicy::triple_buffered());
        stream.advance_client_buffer().unwrap();

        stream
            .set_buffering(BufferingPolicy::double_buffered())
            .unwrap();
        assert!(!stream.active().swapper.lock_free());
        stream
            .set_buffering(BufferingPolicy::double_buffered())
            .unwrap();

        // No compositor is running: a blocking swapper would stall the second advance.
        let (tx, rx) = channel::bounded(1);
        let client = Arc::clone(&stream);
        thread::spawn(move || {
            let result = (0..10).try_for_each(|_| client.advance_client_buffer().map(|_| ()));
            let _ = tx.send(result.map_err(|err| err.to_string()));
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

        assert!(stream.active().swapper.lock_free());
        assert_eq!(stream.buffering(), BufferingPolicy::double_buffered());
        assert_eq!(stream.buffer_count(), 2);
    }

    #[test]
    fn lock_free_waits_for_compositor_buffer() {
        let stream = stream(BufferingPolicy::triple_buffered());
        stream.advance_client_buffer().unwrap();
        stream.advance_client_buffer().unwrap();
        let frame = stream.lock_compositor_buffer().unwrap();

        stream
            .set_buffering(BufferingPolicy::double_buffered())
            .unwrap();
        drop(frame);
        assert!(!stream.active().swapper.lock_free());

        stream.advance_client_buffer().unwrap();
        assert!(stream.active().swapper.lock_free());
        let client = stream.client_buffer().unwrap().id();
        let shown = stream.with_compositor_buffer(|buffer| buffer.id()).unwrap();
        assert_ne!(client, shown);
    }

    #[test]
    fn failed_submit_keeps_client_buffer() {
        let stream = stream(BufferingPolicy::triple_buffered());
        let rendering = stream.advance_client_buffer().unwrap();
        // Hand the buffer back behind the stream's back so its own submit is rejected.
        stream
            .active()
            .swapper
            .client_release(Arc::clone(&rendering))
            .unwrap();

        assert!(matches!(
            stream.advance_client_buffer(),
            Err(SurfaceError::Swapper(SwapperError::UnexpectedRelease { id })) if id == rendering.id()
        ));
        assert_eq!(stream.client_buffer().unwrap().id(), rendering.id());
    }

    #[test]
    fn surface_ids_are_unique() {
        assert_ne!(SurfaceId::new(), SurfaceId::new());
    }
}
