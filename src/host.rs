//! Host-facing surface: callback traits, the plane allocator, and the
//! main-context dispatcher every callback is delivered through.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{ConvertError, ErrorCode};
use crate::video::{CodecSpecificInfo, EncodedFrame, PlanarFrame, Plane};

pub trait DecoderCallback: Send + Sync {
    fn decoded(&self, frame: PlanarFrame);
    fn error(&self, code: ErrorCode);
    fn input_data_exhausted(&self);
    fn drain_complete(&self);
    fn reset_complete(&self);
}

pub trait EncoderCallback: Send + Sync {
    fn encoded(&self, frame: EncodedFrame, info: CodecSpecificInfo);
    fn error(&self, code: ErrorCode);
}

/// Creates the planes handed back to the host.
pub trait FrameAllocator: Send + Sync {
    fn create_plane(&self, data: &[u8], stride: u32) -> Result<Plane, ConvertError>;
    fn create_empty_plane(&self, size: usize, stride: u32) -> Result<Plane, ConvertError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl FrameAllocator for HeapAllocator {
    fn create_plane(&self, data: &[u8], stride: u32) -> Result<Plane, ConvertError> {
        Ok(Plane {
            data: data.to_vec(),
            stride,
        })
    }

    fn create_empty_plane(&self, size: usize, stride: u32) -> Result<Plane, ConvertError> {
        Ok(Plane {
            data: vec![0; size],
            stride,
        })
    }
}

type Task = Box<dyn FnOnce() + Send>;

/// Posting side of the host's main execution context.
///
/// The thread that calls [`MainContext::new`] owns the context and must
/// drive the returned [`MainLoop`].
#[derive(Clone)]
pub struct MainContext {
    tx: Sender<Task>,
    owner: ThreadId,
}

pub struct MainLoop {
    rx: Receiver<Task>,
}

impl MainContext {
    pub fn new() -> (MainContext, MainLoop) {
        let (tx, rx) = mpsc::channel();
        let context = MainContext {
            tx,
            owner: thread::current().id(),
        };
        (context, MainLoop { rx })
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Queues `task` for the owner. Returns false once the loop is gone.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(task)).is_ok()
    }

    /// Runs `task` on the owner and waits for it to finish.
    ///
    /// Runs inline when already on the owner thread. Returns false if the
    /// task was dropped without running.
    pub fn post_sync(&self, task: impl FnOnce() + Send + 'static) -> bool {
        if self.is_owner_thread() {
            task();
            return true;
        }
        let (done_tx, done_rx) = mpsc::sync_channel::<()>(1);
        let posted = self.post(move || {
            task();
            let _ = done_tx.send(());
        });
        posted && done_rx.recv().is_ok()
    }
}

impl MainLoop {
    /// Runs everything queued so far, returning how many tasks ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Runs tasks until `done` holds or `timeout` elapses.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(Duration::from_millis(10));
            match self.rx.recv_timeout(wait) {
                Ok(task) => task(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return done(),
            }
        }
    }
}
