//! Encode session: host I420 frames in, coded frames out.
//!
//! Mirrors the decode side: `encode` packs the frame on the caller's thread
//! and a private worker performs the blocking `queue` call. Encoded data
//! raised on a hardware thread is handed to the main context synchronously,
//! and a shutdown that lands during that hand-off waits for it to return.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::error::{CodecError, ErrorCode};
use crate::hal::{CodecListener, CodecService, EncoderMetadata, HwCodec, InputBuffer};
use crate::host::{EncoderCallback, MainContext};
use crate::observability::{SessionMetrics, SessionSnapshot, log_snapshot};
use crate::session::{SessionState, lock};
use crate::video::convert::{SoftwareLayout, pack_i420};
use crate::video::reframe::annex_b_to_length_prefixed;
use crate::video::{
    BufferFraming, CodecSpecificInfo, EncodedData, EncodedFrame, PlanarFrame, StreamConfig,
    VideoCodec,
};

pub struct EncoderSession {
    shared: Arc<Shared>,
}

struct Shared {
    service: Arc<dyn CodecService>,
    main: MainContext,
    metrics: SessionMetrics,
    callback: Mutex<Option<Arc<dyn EncoderCallback>>>,
    setup: Mutex<Option<EncoderSetup>>,
    state: Mutex<SessionState>,
    codec: Mutex<Option<Arc<dyn HwCodec>>>,
    stop: Mutex<StopFlags>,
    worker: Mutex<Option<QueueWorker>>,
}

#[derive(Debug, Clone)]
struct EncoderSetup {
    metadata: EncoderMetadata,
    layout: SoftwareLayout,
}

#[derive(Debug, Default)]
struct StopFlags {
    stopping: bool,
    processing: bool,
    stop_pending: bool,
}

struct QueueWorker {
    tx: Sender<InputBuffer>,
    handle: JoinHandle<()>,
}

impl QueueWorker {
    fn spawn(session: Weak<Shared>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<InputBuffer>();
        let handle = thread::Builder::new()
            .name("gmp-encode".to_string())
            .spawn(move || {
                for buffer in rx {
                    let Some(session) = session.upgrade() else {
                        break;
                    };
                    session.queue_buffer(buffer);
                }
                debug!("Encode worker exiting");
            })?;
        Ok(Self { tx, handle })
    }

    fn join(self) {
        drop(self.tx);
        if self.handle.join().is_err() {
            error!("Encode worker panicked");
        }
    }
}

impl EncoderSession {
    pub fn new(service: Arc<dyn CodecService>, main: MainContext) -> Self {
        let shared = Shared {
            service,
            main,
            metrics: SessionMetrics::new(),
            callback: Mutex::new(None),
            setup: Mutex::new(None),
            state: Mutex::new(SessionState::Idle),
            codec: Mutex::new(None),
            stop: Mutex::new(StopFlags::default()),
            worker: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Checks the hardware can encode this stream and picks the input layout
    /// from the formats the encoder accepts.
    pub fn configure(
        &self,
        config: &StreamConfig,
        callback: Arc<dyn EncoderCallback>,
    ) -> Result<(), CodecError> {
        let shared = &self.shared;
        if lock(&shared.stop).stopping {
            return Err(CodecError::Generic("session has been shut down".into()));
        }
        if lock(&shared.codec).is_some() {
            return Err(CodecError::InvalidArgument(
                "codec already open; a new configuration needs a new session".into(),
            ));
        }
        *lock(&shared.callback) = Some(callback);

        if config.width == 0 || config.height == 0 {
            let err = CodecError::InvalidArgument(format!(
                "invalid dimensions {}x{}",
                config.width, config.height
            ));
            shared.report_error(err.code());
            return Err(err);
        }
        if !shared.service.is_supported(config.codec, true) {
            error!(mime = config.codec.mime_type(), "Codec not supported");
            let err = CodecError::Unsupported(format!(
                "no hardware encoder for {}",
                config.codec.mime_type()
            ));
            shared.report_error(err.code());
            return Err(err);
        }

        let constants = shared.service.color_format_constants();
        let chosen = shared
            .service
            .supported_color_formats(config.codec)
            .into_iter()
            .find_map(|format| {
                match SoftwareLayout::from_color_format(format, &constants) {
                    Some(layout @ (SoftwareLayout::Planar | SoftwareLayout::SemiPlanar)) => {
                        Some((format, layout))
                    }
                    _ => None,
                }
            });
        let Some((color_format, layout)) = chosen else {
            error!(mime = config.codec.mime_type(), "No supported input colour format");
            let err = CodecError::Unsupported("no usable encoder input colour format".into());
            shared.report_error(err.code());
            return Err(err);
        };

        let metadata = EncoderMetadata {
            codec: config.codec,
            width: config.width,
            height: config.height,
            fps: config.max_framerate.filter(|fps| *fps > 0),
            bitrate: config.bitrate,
            color_format,
        };
        info!(
            mime = metadata.codec.mime_type(),
            width = metadata.width,
            height = metadata.height,
            fps = ?metadata.fps,
            bitrate = ?metadata.bitrate,
            color_format,
            layout = ?layout,
            "Encoder metadata prepared"
        );
        *lock(&shared.setup) = Some(EncoderSetup { metadata, layout });
        shared.set_state(SessionState::Configured);
        Ok(())
    }

    /// Packs `frame` into the chosen input layout and hands it to the queue
    /// worker, opening the encoder on first use. Never blocks on the encoder.
    pub fn encode(&self, frame: &PlanarFrame, key_frame: bool) -> Result<(), CodecError> {
        let shared = &self.shared;
        if lock(&shared.stop).stopping {
            return Err(CodecError::Generic("session has been shut down".into()));
        }
        let setup = lock(&shared.setup)
            .clone()
            .ok_or_else(|| CodecError::InvalidArgument("encode before configure".into()))?;
        if frame.width != setup.metadata.width || frame.height != setup.metadata.height {
            return Err(CodecError::InvalidArgument(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width, frame.height, setup.metadata.width, setup.metadata.height
            )));
        }

        shared.ensure_codec(&setup.metadata).inspect_err(|err| {
            shared.report_error(err.code());
        })?;
        let data = pack_i420(frame, setup.layout).map_err(|err| {
            error!(%err, "Couldn't pack encoder input");
            shared.report_error(ErrorCode::EncodeError);
            CodecError::Encode(err.to_string())
        })?;

        debug!(
            size = data.len(),
            timestamp = frame.timestamp,
            key_frame,
            "Encode"
        );
        let metrics = shared.metrics.clone();
        let buffer = InputBuffer::new(data, frame.timestamp, key_frame, move || {
            metrics.record_input_released()
        });

        let mut worker = lock(&shared.worker);
        if worker.is_none() {
            match QueueWorker::spawn(Arc::downgrade(shared)) {
                Ok(spawned) => *worker = Some(spawned),
                Err(err) => {
                    drop(worker);
                    error!(%err, "Couldn't create encode thread");
                    shared.report_error(ErrorCode::GenericError);
                    return Err(CodecError::Generic(format!(
                        "failed to start encode thread: {err}"
                    )));
                }
            }
        }
        shared.metrics.record_submitted();
        if let Some(worker) = worker.as_ref()
            && worker.tx.send(buffer).is_err()
        {
            warn!(timestamp = frame.timestamp, "Encode worker is gone; frame dropped");
        }
        Ok(())
    }

    /// Closes the encoder. No callback is delivered afterwards.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        *lock(&shared.callback) = None;
        let mut stop = lock(&shared.stop);
        if stop.stopping {
            return;
        }
        stop.stopping = true;
        shared.set_state(SessionState::ShuttingDown);
        if stop.processing {
            debug!("Deferring shutdown until encoded data is delivered");
            stop.stop_pending = true;
            return;
        }
        drop(stop);
        shared.teardown();
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    pub fn has_codec(&self) -> bool {
        lock(&self.shared.codec).is_some()
    }

    pub fn input_layout(&self) -> Option<SoftwareLayout> {
        lock(&self.shared.setup).as_ref().map(|setup| setup.layout)
    }

    pub fn metrics(&self) -> SessionSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Drop for EncoderSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    fn report_error(self: &Arc<Self>, code: ErrorCode) {
        self.metrics.record_error();
        let session = Arc::downgrade(self);
        self.main.post(move || {
            let Some(session) = session.upgrade() else {
                return;
            };
            let callback = lock(&session.callback).clone();
            if let Some(callback) = callback {
                callback.error(code);
            }
        });
    }

    fn ensure_codec(self: &Arc<Self>, metadata: &EncoderMetadata) -> Result<Arc<dyn HwCodec>, CodecError> {
        let mut slot = lock(&self.codec);
        if let Some(codec) = slot.as_ref() {
            return Ok(Arc::clone(codec));
        }
        let codec = self.service.create_encoder(metadata).map_err(|err| {
            error!(%err, "Failed to create the encoder");
            CodecError::Encode(err.to_string())
        })?;
        let listener: Arc<dyn CodecListener> = Arc::new(EncoderListener {
            session: Arc::downgrade(self),
        });
        codec.set_listener(Some(listener));
        if let Err(err) = codec.start() {
            codec.set_listener(None);
            codec.destroy();
            error!(%err, "Failed to start the encoder");
            return Err(CodecError::Encode(err.to_string()));
        }
        info!(mime = metadata.codec.mime_type(), "Encoder created");
        *slot = Some(Arc::clone(&codec));
        drop(slot);
        self.set_state(SessionState::Running);
        Ok(codec)
    }

    // Worker thread.
    fn queue_buffer(&self, buffer: InputBuffer) {
        if lock(&self.stop).stopping {
            debug!(timestamp = buffer.timestamp(), "Dropping frame queued before shutdown");
            return;
        }
        let codec = lock(&self.codec).clone();
        match codec {
            // Blocks while the encoder's input queue is full.
            Some(codec) => codec.queue(buffer),
            None => warn!(timestamp = buffer.timestamp(), "Encoder closed; frame dropped"),
        }
    }

    fn teardown(&self) {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            debug!("Stopping encode thread");
            worker.join();
        }
        let codec = lock(&self.codec).take();
        if let Some(codec) = codec {
            codec.set_listener(None);
            codec.stop();
            codec.destroy();
            info!("Encoder destroyed");
        }
        log_snapshot(&self.metrics.snapshot());
    }

    // Hardware thread.
    fn deliver_data(self: &Arc<Self>, data: EncodedData) {
        self.metrics.record_output();
        {
            let mut stop = lock(&self.stop);
            if stop.stopping {
                debug!(timestamp = data.timestamp_ns, "Dropping encoded data while stopping");
                return;
            }
            stop.processing = true;
        }

        let session = Arc::clone(self);
        if !self.main.post_sync(move || session.process_encoded(data)) {
            warn!("Main context gone; encoded data dropped");
        }

        let pending = {
            let mut stop = lock(&self.stop);
            stop.processing = false;
            std::mem::take(&mut stop.stop_pending)
        };
        if pending {
            let session = Arc::clone(self);
            if !self.main.post(move || session.teardown()) {
                warn!("Main context gone; encoder teardown not scheduled");
            }
        }
    }

    // Main context.
    fn process_encoded(&self, data: EncodedData) {
        let Some(callback) = lock(&self.callback).clone() else {
            debug!("Discarding encoded data received after shutdown");
            return;
        };
        let Some(setup) = lock(&self.setup).clone() else {
            return;
        };

        let mut bytes = data.data;
        let framing = if setup.metadata.codec == VideoCodec::H264 {
            let units = annex_b_to_length_prefixed(&mut bytes);
            debug!(units, "Rewrote start codes as lengths");
            BufferFraming::Length32
        } else {
            BufferFraming::Single
        };
        let timestamp = data.timestamp_ns / 1000;
        debug!(size = bytes.len(), timestamp, key_frame = data.key_frame, "Encoded");

        let frame = EncodedFrame {
            data: bytes,
            timestamp,
            key_frame: data.key_frame,
            width: setup.metadata.width,
            height: setup.metadata.height,
        };
        callback.encoded(
            frame,
            CodecSpecificInfo {
                codec: setup.metadata.codec,
                framing,
            },
        );
        self.metrics.record_encoded();
    }
}

struct EncoderListener {
    session: Weak<Shared>,
}

impl CodecListener for EncoderListener {
    fn on_error(&self, code: i32) {
        error!(code, "Hardware encoder error");
        if let Some(session) = self.session.upgrade() {
            session.report_error(ErrorCode::EncodeError);
        }
    }

    fn on_end_of_stream(&self) {
        debug!("Encoder EOS");
    }

    fn on_data_available(&self, data: EncodedData) {
        if let Some(session) = self.session.upgrade() {
            session.deliver_data(data);
        }
    }
}
