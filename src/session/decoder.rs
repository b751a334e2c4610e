//! Decode session: host coded frames in, I420 frames out.
//!
//! Three threads touch a session. The host's main context calls the public
//! methods and receives every callback. A private worker performs the
//! blocking `queue` call. Hardware threads raise codec events; decoded frames
//! are handed to the main context synchronously, so at most one delivery is
//! ever in flight and a reset that lands during it is deferred until it ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::error::{CodecError, ErrorCode};
use crate::hal::{CodecListener, CodecService, DecoderMetadata, HwCodec, InputBuffer};
use crate::host::{DecoderCallback, FrameAllocator, MainContext};
use crate::observability::{SessionMetrics, SessionSnapshot, log_snapshot};
use crate::session::{DurationCache, SessionState, lock};
use crate::video::convert::PixelConverter;
use crate::video::reframe::length_prefixed_to_annex_b;
use crate::video::{CodedFrame, RawFrame, StreamConfig, VideoCodec};

pub struct DecoderSession {
    shared: Arc<Shared>,
}

struct Shared {
    service: Arc<dyn CodecService>,
    main: MainContext,
    metrics: SessionMetrics,
    host: Mutex<HostHandles>,
    metadata: Mutex<Option<DecoderMetadata>>,
    state: Mutex<SessionState>,
    // Serializes creation and destruction of the hardware handle.
    codec: Mutex<Option<Arc<dyn HwCodec>>>,
    stop: Mutex<StopFlags>,
    drain: Mutex<DrainState>,
    // Only touched on the main context.
    converter: Mutex<Option<PixelConverter>>,
    converter_stale: AtomicBool,
    worker: Mutex<Option<SubmitWorker>>,
}

struct HostHandles {
    callback: Option<Arc<dyn DecoderCallback>>,
    allocator: Option<Arc<dyn FrameAllocator>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Reset,
    Shutdown,
}

#[derive(Debug, Default)]
struct StopFlags {
    resetting: bool,
    delivering: bool,
    shut_down: bool,
    deferred: Option<Teardown>,
}

#[derive(Debug, Default)]
struct DrainState {
    draining: bool,
    // Set by the codec's end of stream; a drain still on the worker then
    // leaves the completion to it.
    end_of_stream: bool,
    // A codec drain finished on its in-flight count; the end of stream that
    // follows it is not reported again.
    completed_before_eos: bool,
    durations: DurationCache,
}

enum WorkerJob {
    Submit(InputBuffer),
    Drain,
}

struct SubmitWorker {
    tx: Sender<WorkerJob>,
    handle: JoinHandle<()>,
}

impl SubmitWorker {
    fn spawn(session: Weak<Shared>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<WorkerJob>();
        let handle = thread::Builder::new()
            .name("gmp-submit".to_string())
            .spawn(move || {
                for job in rx {
                    let Some(session) = session.upgrade() else {
                        break;
                    };
                    match job {
                        WorkerJob::Submit(buffer) => session.submit_buffer(buffer),
                        WorkerJob::Drain => session.drain_on_worker(),
                    }
                }
                debug!("Submit worker exiting");
            })?;
        Ok(Self { tx, handle })
    }

    fn send(&self, job: WorkerJob) -> bool {
        self.tx.send(job).is_ok()
    }

    fn join(self) {
        drop(self.tx);
        if self.handle.join().is_err() {
            error!("Submit worker panicked");
        }
    }
}

impl DecoderSession {
    pub fn new(
        service: Arc<dyn CodecService>,
        main: MainContext,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Self {
        let shared = Shared {
            service,
            main,
            metrics: SessionMetrics::new(),
            host: Mutex::new(HostHandles {
                callback: None,
                allocator: Some(allocator),
            }),
            metadata: Mutex::new(None),
            state: Mutex::new(SessionState::Idle),
            codec: Mutex::new(None),
            stop: Mutex::new(StopFlags::default()),
            drain: Mutex::new(DrainState::default()),
            converter: Mutex::new(None),
            converter_stale: AtomicBool::new(false),
            worker: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Validates the stream against the hardware and stores it. The codec
    /// itself is opened by the first submitted frame.
    pub fn configure(
        &self,
        config: &StreamConfig,
        callback: Arc<dyn DecoderCallback>,
    ) -> Result<(), CodecError> {
        let shared = &self.shared;
        if lock(&shared.stop).shut_down {
            return Err(CodecError::Generic("session has been shut down".into()));
        }
        if lock(&shared.codec).is_some() {
            return Err(CodecError::InvalidArgument(
                "codec already open; a new configuration needs a new session".into(),
            ));
        }
        lock(&shared.host).callback = Some(callback);

        if config.width == 0 || config.height == 0 {
            let err = CodecError::InvalidArgument(format!(
                "invalid dimensions {}x{}",
                config.width, config.height
            ));
            shared.report_error(err.code());
            return Err(err);
        }
        if !shared.service.is_supported(config.codec, false) {
            error!(mime = config.codec.mime_type(), "Codec not supported");
            let err = CodecError::Unsupported(format!(
                "no hardware decoder for {}",
                config.codec.mime_type()
            ));
            shared.report_error(err.code());
            return Err(err);
        }

        // The first byte of the H.264 blob is the host's packetization header.
        let codec_data = match config.codec_data.split_first() {
            Some((_, avcc)) if config.codec == VideoCodec::H264 => avcc.to_vec(),
            _ => Vec::new(),
        };
        let metadata = DecoderMetadata {
            codec: config.codec,
            width: config.width,
            height: config.height,
            fps: config.max_framerate.filter(|fps| *fps > 0),
            codec_data,
            hardware_only: true,
            no_media_buffer: true,
        };
        info!(
            mime = metadata.codec.mime_type(),
            width = metadata.width,
            height = metadata.height,
            fps = ?metadata.fps,
            extra = metadata.codec_data.len(),
            "Decoder metadata prepared"
        );
        *lock(&shared.metadata) = Some(metadata);
        shared.set_state(SessionState::Configured);
        Ok(())
    }

    /// Queues one coded frame. Hardware failures arrive later through the
    /// `error` callback.
    pub fn submit(&self, mut frame: CodedFrame) -> Result<(), CodecError> {
        let shared = &self.shared;
        if lock(&shared.stop).shut_down {
            return Err(CodecError::Generic("session has been shut down".into()));
        }
        let codec = lock(&shared.metadata)
            .as_ref()
            .map(|metadata| metadata.codec)
            .ok_or_else(|| CodecError::InvalidArgument("submit before configure".into()))?;

        debug!(
            size = frame.data.len(),
            timestamp = frame.timestamp,
            duration = frame.duration,
            "Decode"
        );
        if codec == VideoCodec::H264 && frame.framing.length_size().is_some() {
            let report = length_prefixed_to_annex_b(&mut frame.data, frame.framing);
            debug!(units = report.units, stop = ?report.stop, "Rewrote NAL length prefixes");
        }

        let timestamp = frame.timestamp;
        lock(&shared.drain)
            .durations
            .insert(timestamp, frame.duration);
        shared.metrics.record_submitted();

        let metrics = shared.metrics.clone();
        let buffer = InputBuffer::new(frame.data, timestamp, frame.key_frame, move || {
            metrics.record_input_released()
        });

        let mut worker = lock(&shared.worker);
        if worker.is_none() {
            match SubmitWorker::spawn(Arc::downgrade(shared)) {
                Ok(spawned) => *worker = Some(spawned),
                Err(err) => {
                    drop(worker);
                    error!(%err, "Couldn't create submit thread");
                    lock(&shared.drain).durations.take(timestamp);
                    shared.report_error(ErrorCode::GenericError);
                    return Err(CodecError::Generic(format!(
                        "failed to start submit thread: {err}"
                    )));
                }
            }
        }
        if let Some(worker) = worker.as_ref()
            && !worker.send(WorkerJob::Submit(buffer))
        {
            warn!(timestamp, "Submit worker is gone; frame dropped");
        }
        Ok(())
    }

    /// Asks the codec to flush. `drain_complete` follows once nothing is in
    /// flight, or straight away if nothing was submitted.
    pub fn drain(&self) {
        let shared = &self.shared;
        let worker = lock(&shared.worker);
        match worker.as_ref() {
            Some(worker) if worker.send(WorkerJob::Drain) => {}
            _ => {
                drop(worker);
                debug!("Nothing in flight, drain completes immediately");
                shared.finish_drain();
            }
        }
    }

    /// Drops all in-flight work and closes the codec; `reset_complete`
    /// follows. A reset requested while one is pending is ignored.
    pub fn reset(&self) {
        let shared = &self.shared;
        let mut stop = lock(&shared.stop);
        if stop.shut_down || stop.resetting {
            debug!("Reset already in progress");
            return;
        }
        stop.resetting = true;
        shared.set_state(SessionState::Resetting);
        if stop.delivering {
            debug!("Deferring reset until the frame in delivery returns");
            stop.deferred = Some(Teardown::Reset);
            return;
        }
        drop(stop);
        shared.schedule_teardown(Teardown::Reset);
    }

    /// Releases the host callback and allocator and closes the codec. No
    /// callback is delivered afterwards.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        {
            let mut host = lock(&shared.host);
            host.callback = None;
            host.allocator = None;
        }
        let mut stop = lock(&shared.stop);
        if stop.shut_down {
            return;
        }
        stop.shut_down = true;
        stop.resetting = true;
        shared.set_state(SessionState::ShuttingDown);
        if stop.delivering {
            debug!("Deferring shutdown until the frame in delivery returns");
            stop.deferred = Some(Teardown::Shutdown);
            return;
        }
        drop(stop);
        shared.teardown(Teardown::Shutdown);
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    pub fn has_codec(&self) -> bool {
        lock(&self.shared.codec).is_some()
    }

    /// Frames submitted whose output has not come back yet.
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.drain).durations.len()
    }

    pub fn converter_name(&self) -> Option<&'static str> {
        lock(&self.shared.converter)
            .as_ref()
            .map(PixelConverter::name)
    }

    pub fn metrics(&self) -> SessionSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Drop for DecoderSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    fn callback(&self) -> Option<Arc<dyn DecoderCallback>> {
        lock(&self.host).callback.clone()
    }

    /// Delivers through the main context, looking the callback up only when
    /// the task runs so nothing reaches a host that has shut the session down.
    fn post_callback(self: &Arc<Self>, deliver: impl FnOnce(&dyn DecoderCallback) + Send + 'static) {
        let session = Arc::downgrade(self);
        self.main.post(move || {
            let Some(session) = session.upgrade() else {
                return;
            };
            if let Some(callback) = session.callback() {
                deliver(callback.as_ref());
            }
        });
    }

    fn report_error(self: &Arc<Self>, code: ErrorCode) {
        self.metrics.record_error();
        self.post_callback(move |callback| callback.error(code));
    }

    fn finish_drain(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Draining {
                *state = SessionState::Running;
            }
        }
        lock(&self.drain).draining = false;
        self.post_callback(|callback| callback.drain_complete());
    }

    /// Completes a drain that was forwarded to the codec.
    fn finish_codec_drain(self: &Arc<Self>) {
        lock(&self.drain).completed_before_eos = true;
        self.finish_drain();
    }

    fn schedule_teardown(self: &Arc<Self>, kind: Teardown) {
        let session = Arc::clone(self);
        if !self.main.post(move || session.teardown(kind)) {
            warn!(?kind, "Main context gone; teardown not scheduled");
        }
    }

    fn ensure_codec(self: &Arc<Self>) -> Result<Arc<dyn HwCodec>, CodecError> {
        let mut slot = lock(&self.codec);
        if let Some(codec) = slot.as_ref() {
            return Ok(Arc::clone(codec));
        }
        let metadata = lock(&self.metadata)
            .clone()
            .ok_or_else(|| CodecError::InvalidArgument("decoder is not configured".into()))?;

        let codec = self.service.create_decoder(&metadata).map_err(|err| {
            error!(%err, "Failed to create the decoder");
            CodecError::Decode(err.to_string())
        })?;
        let listener: Arc<dyn CodecListener> = Arc::new(DecoderListener {
            session: Arc::downgrade(self),
        });
        codec.set_listener(Some(listener));
        if let Err(err) = codec.start() {
            codec.set_listener(None);
            codec.destroy();
            error!(%err, "Failed to start the decoder");
            return Err(CodecError::Decode(err.to_string()));
        }
        info!(mime = metadata.codec.mime_type(), "Codec created");
        *slot = Some(Arc::clone(&codec));
        drop(slot);
        self.set_state(SessionState::Running);
        Ok(codec)
    }

    fn forget_duration(self: &Arc<Self>, timestamp: i64) {
        let mut drain = lock(&self.drain);
        drain.durations.take(timestamp);
        if drain.draining && drain.durations.is_empty() {
            drop(drain);
            self.finish_codec_drain();
        }
    }

    // Worker thread.
    fn submit_buffer(self: &Arc<Self>, buffer: InputBuffer) {
        let timestamp = buffer.timestamp();
        if lock(&self.stop).resetting {
            debug!(timestamp, "Dropping buffer queued before reset");
            drop(buffer);
            self.forget_duration(timestamp);
            return;
        }
        if lock(&self.drain).draining {
            error!(timestamp, "Buffer submitted while draining");
            drop(buffer);
            self.forget_duration(timestamp);
            return;
        }

        let codec = match self.ensure_codec() {
            Ok(codec) => codec,
            Err(err) => {
                drop(buffer);
                self.forget_duration(timestamp);
                self.report_error(err.code());
                return;
            }
        };

        // Blocks while the codec's input queue is full.
        codec.queue(buffer);

        if !lock(&self.drain).draining {
            self.post_callback(|callback| callback.input_data_exhausted());
        }
    }

    // Worker thread, ordered after every frame submitted before the drain.
    fn drain_on_worker(self: &Arc<Self>) {
        if lock(&self.stop).resetting {
            debug!("Skipping drain, reset in progress");
            return;
        }
        let codec = lock(&self.codec).clone();
        {
            let mut drain = lock(&self.drain);
            drain.end_of_stream = false;
            drain.completed_before_eos = false;
        }
        if let Some(codec) = &codec {
            codec.drain();
        }

        let mut drain = lock(&self.drain);
        if std::mem::take(&mut drain.end_of_stream) {
            debug!("Drain already completed by end of stream");
            return;
        }
        if codec.is_none() {
            drop(drain);
            self.finish_drain();
        } else if drain.durations.is_empty() {
            drop(drain);
            self.finish_codec_drain();
        } else {
            drain.draining = true;
            let in_flight = drain.durations.len();
            drop(drain);
            self.set_state(SessionState::Draining);
            debug!(in_flight, "Draining");
        }
    }

    // Main context.
    fn teardown(self: &Arc<Self>, kind: Teardown) {
        info!(?kind, "Tearing down codec");
        let codec = lock(&self.codec).clone();
        if let Some(codec) = codec {
            debug!("Codec draining");
            codec.drain();
        }

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            debug!("Stopping submit thread");
            worker.join();
        }

        let codec = lock(&self.codec).take();
        if let Some(codec) = codec {
            codec.set_listener(None);
            codec.stop();
            codec.destroy();
            debug!("Codec destroyed");
        }

        {
            let mut drain = lock(&self.drain);
            drain.durations.clear();
            drain.draining = false;
            drain.end_of_stream = false;
            drain.completed_before_eos = false;
        }
        *lock(&self.converter) = None;
        self.converter_stale.store(false, Ordering::SeqCst);

        let mut stop = lock(&self.stop);
        if stop.shut_down {
            drop(stop);
            self.set_state(SessionState::ShuttingDown);
            log_snapshot(&self.metrics.snapshot());
            return;
        }
        stop.resetting = false;
        drop(stop);
        self.set_state(SessionState::Configured);
        if kind == Teardown::Reset {
            self.post_callback(|callback| callback.reset_complete());
        }
    }

    // Hardware thread.
    fn deliver_frame(self: &Arc<Self>, frame: RawFrame) {
        self.metrics.record_output();
        {
            let mut stop = lock(&self.stop);
            if stop.resetting {
                info!(
                    timestamp = frame.timestamp_ns,
                    "Received decoded frame while resetting codec"
                );
                self.metrics.record_discarded();
                return;
            }
            stop.delivering = true;
        }

        let session = Arc::clone(self);
        if !self.main.post_sync(move || session.process_frame(frame)) {
            warn!("Main context gone; decoded frame dropped");
            self.metrics.record_discarded();
        }

        let deferred = {
            let mut stop = lock(&self.stop);
            stop.delivering = false;
            stop.deferred.take()
        };
        if let Some(kind) = deferred {
            debug!(?kind, "Running deferred teardown");
            self.schedule_teardown(kind);
        }
    }

    // Main context.
    fn process_frame(self: &Arc<Self>, frame: RawFrame) {
        let (callback, allocator) = {
            let host = lock(&self.host);
            (host.callback.clone(), host.allocator.clone())
        };
        let (Some(callback), Some(allocator)) = (callback, allocator) else {
            info!("Discarding decoded frame received after shutdown");
            self.metrics.record_discarded();
            return;
        };
        if lock(&self.stop).resetting {
            info!("Discarding decoded frame received while resetting");
            self.metrics.record_discarded();
            return;
        }

        let timestamp = frame.timestamp_ns / 1000;
        let duration = lock(&self.drain).durations.take(timestamp).unwrap_or(0);

        let mut converter = lock(&self.converter);
        if self.converter_stale.swap(false, Ordering::SeqCst) {
            debug!("Resetting converter");
            *converter = None;
        }
        if converter.is_none() {
            info!(
                stride = frame.stride,
                slice_height = frame.slice_height,
                top = frame.crop.top,
                left = frame.crop.left,
                width = frame.crop.width(),
                height = frame.crop.height(),
                format = frame.color_format,
                "Configuring converter"
            );
            *converter = PixelConverter::select(self.service.as_ref(), &frame);
            if let Some(selected) = converter.as_ref() {
                info!(converter = selected.name(), "Colour converter selected");
            }
        }
        let result = converter
            .as_mut()
            .map(|active| active.convert(allocator.as_ref(), &frame));
        drop(converter);

        let mut planar = match result {
            Some(Ok(planar)) => planar,
            Some(Err(err)) => {
                error!(%err, "Couldn't make decoded frame");
                self.metrics.record_discarded();
                self.report_error(ErrorCode::DecodeError);
                self.complete_drain_if_idle();
                return;
            }
            None => {
                error!(format = frame.color_format, "Converter not found");
                self.metrics.record_discarded();
                self.report_error(ErrorCode::DecodeError);
                self.complete_drain_if_idle();
                return;
            }
        };

        planar.timestamp = timestamp;
        planar.duration = duration;
        callback.decoded(planar);
        self.metrics.record_decoded();
        debug!(timestamp, duration, "Returned decoded frame");
        self.complete_drain_if_idle();
    }

    fn complete_drain_if_idle(self: &Arc<Self>) {
        let drain = lock(&self.drain);
        if drain.draining && drain.durations.is_empty() {
            drop(drain);
            self.finish_codec_drain();
        } else {
            debug!(in_flight = drain.durations.len(), "Buffers still out");
        }
    }

    // Hardware thread.
    fn end_of_stream(self: &Arc<Self>) {
        if lock(&self.stop).resetting {
            debug!("Ignoring end of stream during teardown");
            return;
        }
        let mut drain = lock(&self.drain);
        let in_flight = drain.durations.len();
        drain.durations.clear();
        if std::mem::take(&mut drain.completed_before_eos) {
            debug!(in_flight, "End of stream after the drain already completed");
            return;
        }
        drain.end_of_stream = true;
        let was_draining = drain.draining;
        drop(drain);
        debug!(in_flight, was_draining, "End of stream, drain complete");
        self.finish_drain();
    }
}

struct DecoderListener {
    session: Weak<Shared>,
}

impl CodecListener for DecoderListener {
    fn on_size_changed(&self, width: u32, height: u32) {
        info!(width, height, "Received size changed");
        if let Some(session) = self.session.upgrade() {
            session.converter_stale.store(true, Ordering::SeqCst);
        }
    }

    fn on_error(&self, code: i32) {
        error!(code, "Hardware decoder error");
        if let Some(session) = self.session.upgrade() {
            session.report_error(ErrorCode::DecodeError);
        }
    }

    fn on_end_of_stream(&self) {
        debug!("Codec EOS");
        if let Some(session) = self.session.upgrade() {
            session.end_of_stream();
        }
    }

    fn on_frame_decoded(&self, frame: RawFrame) {
        debug!(timestamp = frame.timestamp_ns, "Received decoded frame");
        if let Some(session) = self.session.upgrade() {
            session.deliver_frame(frame);
        }
    }
}
