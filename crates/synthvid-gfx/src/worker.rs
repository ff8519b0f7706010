//! Serialized execution for the engine.
//!
//! All state-changing calls, the periodic image refresh and host feature changes run one at a
//! time on a single worker thread that owns the [`SynthVideoDevice`]. Acks from the host bypass
//! the queue: they complete the transport's pending transaction directly, which is what unblocks
//! the worker while it waits for a response.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use synthvid_protocol::FeatureChange;

use crate::channel::Transport;
use crate::config::SynthVideoConfig;
use crate::cursor::CursorImage;
use crate::device::{dispatch_inbound, DeviceSnapshot, GraphicsInfo, SynthVideoDevice};
use crate::error::{GfxError, Result};

type Reply<T> = Sender<Result<T>>;

enum Command {
    InitGraphics(Reply<GraphicsInfo>),
    SetResolution {
        width: u32,
        height: u32,
        wait_for_ack: bool,
        reply: Reply<()>,
    },
    SetCursorShape {
        image: Option<CursorImage>,
        resend: bool,
        reply: Reply<()>,
    },
    SetCursorPosition {
        x: i32,
        y: i32,
        visible: bool,
        resend: bool,
        reply: Reply<()>,
    },
    MarkDirty {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    MarkFullScreen,
    Refresh(Reply<()>),
    FeatureChange(FeatureChange),
    Snapshot(Sender<DeviceSnapshot>),
    Stop(Reply<()>),
    Shutdown,
}

/// Cloneable, thread-safe front end to a [`SynthVideoWorker`].
pub struct SynthVideoHandle<T: Transport> {
    commands: Sender<Command>,
    transport: Arc<T>,
}

impl<T: Transport> Clone for SynthVideoHandle<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: Transport> SynthVideoHandle<T> {
    fn call<R>(&self, make: impl FnOnce(Reply<R>) -> Command) -> Result<R> {
        let (reply, rx) = mpsc::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| GfxError::WorkerGone)?;
        rx.recv().map_err(|_| GfxError::WorkerGone)?
    }

    fn post(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| GfxError::WorkerGone)
    }

    pub fn init_graphics(&self) -> Result<GraphicsInfo> {
        self.call(Command::InitGraphics)
    }

    pub fn set_resolution(&self, width: u32, height: u32, wait_for_ack: bool) -> Result<()> {
        self.call(|reply| Command::SetResolution {
            width,
            height,
            wait_for_ack,
            reply,
        })
    }

    pub fn set_cursor_shape(&self, image: Option<CursorImage>, resend: bool) -> Result<()> {
        self.call(|reply| Command::SetCursorShape {
            image,
            resend,
            reply,
        })
    }

    pub fn set_cursor_position(&self, x: i32, y: i32, visible: bool, resend: bool) -> Result<()> {
        self.call(|reply| Command::SetCursorPosition {
            x,
            y,
            visible,
            resend,
            reply,
        })
    }

    /// Queues a dirty region; it is sent by the next refresh.
    pub fn mark_dirty(&self, x: u32, y: u32, width: u32, height: u32) -> Result<()> {
        self.post(Command::MarkDirty {
            x,
            y,
            width,
            height,
        })
    }

    pub fn mark_full_screen_dirty(&self) -> Result<()> {
        self.post(Command::MarkFullScreen)
    }

    /// Refreshes now instead of waiting for the timer.
    pub fn refresh_image(&self) -> Result<()> {
        self.call(Command::Refresh)
    }

    pub fn stop(&self) -> Result<()> {
        self.call(Command::Stop)
    }

    pub fn snapshot(&self) -> Result<DeviceSnapshot> {
        let (reply, rx) = mpsc::channel();
        self.post(Command::Snapshot(reply))?;
        rx.recv().map_err(|_| GfxError::WorkerGone)
    }

    /// Entry point for packets arriving from the host. Runs on the transport's thread.
    pub fn handle_inbound(&self, packet: &[u8]) {
        if let Some(change) = dispatch_inbound(&*self.transport, packet) {
            if self.post(Command::FeatureChange(change)).is_err() {
                tracing::debug!("synthvid worker gone, dropping feature change");
            }
        }
    }
}

/// Owns the worker thread. Dropping it stops the thread.
pub struct SynthVideoWorker<T: Transport + 'static> {
    handle: SynthVideoHandle<T>,
    thread: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static> SynthVideoWorker<T> {
    pub fn spawn(transport: Arc<T>, config: SynthVideoConfig) -> Result<Self> {
        let (commands, rx) = mpsc::channel();
        let device = SynthVideoDevice::new(Arc::clone(&transport), config);
        let thread = thread::Builder::new()
            .name("synthvid-worker".into())
            .spawn(move || run(device, rx))
            .map_err(|err| {
                tracing::error!("failed to spawn synthvid worker: {err}");
                GfxError::NoResources("failed to spawn synthvid worker thread")
            })?;

        Ok(Self {
            handle: SynthVideoHandle {
                commands,
                transport,
            },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SynthVideoHandle<T> {
        self.handle.clone()
    }
}

impl<T: Transport + 'static> Drop for SynthVideoWorker<T> {
    fn drop(&mut self) {
        let _ = self.handle.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("synthvid worker panicked");
            }
        }
    }
}

fn run<T: Transport>(mut device: SynthVideoDevice<T>, rx: Receiver<Command>) {
    let interval = device.config().refresh_interval();
    let mut last_refresh = Instant::now();

    loop {
        let wait = interval.saturating_sub(last_refresh.elapsed());
        match rx.recv_timeout(wait) {
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(command) => execute(&mut device, command),
            Err(RecvTimeoutError::Timeout) => {}
        }

        if last_refresh.elapsed() >= interval {
            if let Err(err) = device.refresh_image() {
                tracing::warn!("periodic image refresh failed: {err}");
            }
            last_refresh = Instant::now();
        }
    }
    tracing::debug!("synthvid worker exiting");
}

fn execute<T: Transport>(device: &mut SynthVideoDevice<T>, command: Command) {
    // A caller that gave up waiting is not an error.
    match command {
        Command::InitGraphics(reply) => {
            let _ = reply.send(device.init_graphics());
        }
        Command::SetResolution {
            width,
            height,
            wait_for_ack,
            reply,
        } => {
            let _ = reply.send(device.set_resolution(width, height, wait_for_ack));
        }
        Command::SetCursorShape {
            image,
            resend,
            reply,
        } => {
            let _ = reply.send(device.set_cursor_shape(image.as_ref(), resend));
        }
        Command::SetCursorPosition {
            x,
            y,
            visible,
            resend,
            reply,
        } => {
            let _ = reply.send(device.set_cursor_position(x, y, visible, resend));
        }
        Command::MarkDirty {
            x,
            y,
            width,
            height,
        } => device.mark_dirty(x, y, width, height),
        Command::MarkFullScreen => device.mark_full_screen_dirty(),
        Command::Refresh(reply) => {
            let _ = reply.send(device.refresh_image());
        }
        Command::FeatureChange(change) => device.handle_feature_change(change),
        Command::Snapshot(reply) => {
            let _ = reply.send(device.snapshot());
        }
        Command::Stop(reply) => {
            device.stop();
            let _ = reply.send(Ok(()));
        }
        Command::Shutdown => {}
    }
}
