//! ### English
//! The compositor thread: one OS thread shared by all surfaces, taking each surface's newest
//! frame once per frame interval and handing it to the display backend.
//!
//! ### 中文
//! 合成线程：所有 surface 共享的单个 OS 线程，每个帧间隔取一次各 surface 的最新帧并交给显示后端。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;

use super::buffer::Buffer;
use super::error::CompositorError;
use super::surface::{SurfaceId, SurfaceStream};

/// ### English
/// Output side of the compositor (scan-out, GL composition, screenshots...).
///
/// ### 中文
/// 合成器的输出端（扫描输出、GL 合成、截图等）。
pub trait DisplayBackend: Send + 'static {
    /// ### English
    /// Shows `buffer` for `surface` in the current frame. The buffer is only valid for the
    /// duration of the call.
    ///
    /// ### 中文
    /// 在当前帧中为 `surface` 显示 `buffer`。缓冲区仅在本次调用期间有效。
    fn post(&mut self, surface: SurfaceId, buffer: &dyn Buffer);

    /// ### English
    /// Called after every surface has been visited for frame number `frame`.
    ///
    /// ### 中文
    /// 在第 `frame` 帧所有 surface 处理完毕后调用。
    fn frame_finished(&mut self, frame: u64) {
        let _ = frame;
    }
}

/// ### English
/// Compositor thread parameters.
///
/// ### 中文
/// 合成线程参数。
#[derive(Clone, Debug)]
pub struct CompositorInit {
    /// ### English
    /// Time between two composition passes.
    ///
    /// ### 中文
    /// 两次合成之间的时间间隔。
    pub frame_interval: Duration,
    pub thread_name: String,
}

impl Default for CompositorInit {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_micros(16_667),
            thread_name: "SwapCompositor".to_string(),
        }
    }
}

enum CompositorMsg {
    AddSurface(Arc<SurfaceStream>),
    RemoveSurface(SurfaceId),
    Shutdown,
}

/// ### English
/// Handle to the compositor thread. Dropping it stops and joins the thread.
///
/// ### 中文
/// 合成线程的句柄。drop 时停止并 join 该线程。
pub struct Compositor {
    /// ### English
    /// Channel sender into the compositor thread.
    ///
    /// ### 中文
    /// 向合成线程发送消息的 channel sender。
    tx: channel::Sender<CompositorMsg>,
    frames: Arc<AtomicU64>,
    /// ### English
    /// Join handle (taken on shutdown).
    ///
    /// ### 中文
    /// 线程的 JoinHandle（关闭时取走）。
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Compositor {
    /// ### English
    /// Spawns the compositor thread.
    ///
    /// #### Parameters
    /// - `init`: Frame interval and thread name.
    /// - `backend`: Receives every composited frame; moved onto the compositor thread.
    ///
    /// ### 中文
    /// 启动合成线程。
    ///
    /// #### 参数
    /// - `init`：帧间隔与线程名。
    /// - `backend`：接收每一帧合成结果；会被移动到合成线程。
    pub fn new<B: DisplayBackend>(
        init: CompositorInit,
        backend: B,
    ) -> Result<Self, CompositorError> {
        let (tx, rx) = channel::unbounded::<CompositorMsg>();
        let frames = Arc::new(AtomicU64::new(0));
        let frame_interval = init.frame_interval.max(Duration::from_millis(1));

        let counter = Arc::clone(&frames);
        let thread = thread::Builder::new()
            .name(init.thread_name)
            .spawn(move || run_compositor(rx, backend, frame_interval, counter))?;

        Ok(Self {
            tx,
            frames,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// ### English
    /// Starts compositing `surface` from the next frame on.
    ///
    /// ### 中文
    /// 从下一帧开始合成 `surface`。
    pub fn add_surface(&self, surface: Arc<SurfaceStream>) -> Result<(), CompositorError> {
        self.tx
            .send(CompositorMsg::AddSurface(surface))
            .map_err(|_| CompositorError::Stopped)
    }

    pub fn remove_surface(&self, id: SurfaceId) -> Result<(), CompositorError> {
        self.tx
            .send(CompositorMsg::RemoveSurface(id))
            .map_err(|_| CompositorError::Stopped)
    }

    /// ### English
    /// Number of composition passes completed so far.
    ///
    /// ### 中文
    /// 迄今完成的合成次数。
    pub fn frames_composited(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// ### English
    /// Stops the thread and waits for it. Later calls do nothing.
    ///
    /// ### 中文
    /// 停止线程并等待其退出。之后的调用不做任何事。
    pub fn shutdown(&self) {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            let _ = self.tx.send(CompositorMsg::Shutdown);
            if thread.join().is_err() {
                log::error!("compositor thread panicked");
            }
        }
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_compositor<B: DisplayBackend>(
    rx: channel::Receiver<CompositorMsg>,
    mut backend: B,
    frame_interval: Duration,
    frames: Arc<AtomicU64>,
) {
    let mut surfaces: Vec<Arc<SurfaceStream>> = Vec::new();
    let mut deadline = Instant::now() + frame_interval;

    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(CompositorMsg::AddSurface(surface)) => {
                if surfaces.iter().all(|known| known.id() != surface.id()) {
                    log::debug!("compositor: added {}", surface.id());
                    surfaces.push(surface);
                }
                continue;
            }
            Ok(CompositorMsg::RemoveSurface(id)) => {
                surfaces.retain(|surface| surface.id() != id);
                log::debug!("compositor: removed {id}");
                continue;
            }
            Ok(CompositorMsg::Shutdown) | Err(channel::RecvTimeoutError::Disconnected) => {
                log::debug!("compositor: stopping");
                return;
            }
            Err(channel::RecvTimeoutError::Timeout) => {}
        }

        let frame = frames.load(Ordering::Relaxed) + 1;
        composite_frame(&mut backend, &mut surfaces, frame);
        frames.store(frame, Ordering::Release);

        let now = Instant::now();
        deadline += frame_interval;
        if deadline <= now {
            // Missed frames are skipped rather than replayed back to back.
            deadline = now + frame_interval;
        }
    }
}

fn composite_frame<B: DisplayBackend>(
    backend: &mut B,
    surfaces: &mut Vec<Arc<SurfaceStream>>,
    frame: u64,
) {
    surfaces.retain(|surface| {
        let open = !surface.is_closed();
        if !open {
            log::debug!("compositor: dropping closed {}", surface.id());
        }
        open
    });

    for surface in surfaces.iter() {
        match surface.lock_compositor_buffer() {
            Ok(buffer) => backend.post(surface.id(), &*buffer),
            Err(err) => log::warn!("compositor: skipping {} this frame: {err}", surface.id()),
        }
    }
    backend.frame_finished(frame);
}
