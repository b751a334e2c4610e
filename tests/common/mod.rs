#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gmp_hwcodec::ErrorCode;
use gmp_hwcodec::hal::loopback::{LoopbackConfig, LoopbackService};
use gmp_hwcodec::host::{DecoderCallback, EncoderCallback, MainContext, MainLoop};
use gmp_hwcodec::video::{
    BufferFraming, CodecSpecificInfo, CodedFrame, EncodedFrame, PlanarFrame, Plane,
};

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Decoded { timestamp: i64, duration: u64 },
    Encoded { timestamp: i64, key_frame: bool },
    Error(ErrorCode),
    InputDataExhausted,
    DrainComplete,
    ResetComplete,
}

/// Records every host callback in arrival order.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    frames: Mutex<Vec<PlanarFrame>>,
    encoded: Mutex<Vec<(EncodedFrame, CodecSpecificInfo)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| matches(e)).count()
    }

    pub fn decoded_count(&self) -> usize {
        self.count(|e| matches!(e, Event::Decoded { .. }))
    }

    pub fn has(&self, event: &Event) -> bool {
        self.events.lock().unwrap().contains(event)
    }

    pub fn frames(&self) -> Vec<PlanarFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn encoded(&self) -> Vec<(EncodedFrame, CodecSpecificInfo)> {
        self.encoded.lock().unwrap().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl DecoderCallback for Recorder {
    fn decoded(&self, frame: PlanarFrame) {
        self.push(Event::Decoded {
            timestamp: frame.timestamp,
            duration: frame.duration,
        });
        self.frames.lock().unwrap().push(frame);
    }

    fn error(&self, code: ErrorCode) {
        self.push(Event::Error(code));
    }

    fn input_data_exhausted(&self) {
        self.push(Event::InputDataExhausted);
    }

    fn drain_complete(&self) {
        self.push(Event::DrainComplete);
    }

    fn reset_complete(&self) {
        self.push(Event::ResetComplete);
    }
}

impl EncoderCallback for Recorder {
    fn encoded(&self, frame: EncodedFrame, info: CodecSpecificInfo) {
        self.push(Event::Encoded {
            timestamp: frame.timestamp,
            key_frame: frame.key_frame,
        });
        self.encoded.lock().unwrap().push((frame, info));
    }

    fn error(&self, code: ErrorCode) {
        self.push(Event::Error(code));
    }
}

pub fn harness(config: LoopbackConfig) -> (Arc<LoopbackService>, MainContext, MainLoop) {
    let service = Arc::new(LoopbackService::new(config));
    let (main, main_loop) = MainContext::new();
    (service, main, main_loop)
}

pub fn coded(timestamp: i64, duration: u64) -> CodedFrame {
    CodedFrame {
        data: vec![0x9d, 0x01, 0x2a, timestamp as u8],
        timestamp,
        duration,
        key_frame: timestamp == 0,
        framing: BufferFraming::Single,
    }
}

/// Flat I420 frame with tight strides.
pub fn i420(width: u32, height: u32, timestamp: i64) -> PlanarFrame {
    let luma = (width * height) as usize;
    PlanarFrame {
        width,
        height,
        y: Plane {
            data: vec![0x10; luma],
            stride: width,
        },
        u: Plane {
            data: vec![0x20; luma / 4],
            stride: width / 2,
        },
        v: Plane {
            data: vec![0x30; luma / 4],
            stride: width / 2,
        },
        timestamp,
        duration: 0,
    }
}

/// Pumps the main loop for a while; used to check nothing else arrives.
pub fn settle(main_loop: &MainLoop) {
    main_loop.run_until(Duration::from_millis(100), || false);
}

/// Polls `done` without running the main loop, so hardware deliveries stay
/// parked in `post_sync`. Gives the hardware thread a moment to get there.
pub fn wait_off_main_loop(done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(50));
    true
}
