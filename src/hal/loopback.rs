//! In-process codec service that stands in for the device.
//!
//! Each started codec owns a "hardware" thread fed through a bounded channel,
//! so `queue` blocks once `queue_depth` inputs are outstanding. Decoders turn
//! every input into a flat-coloured frame in the configured output layout;
//! encoders emit a small synthetic bitstream. Callbacks always arrive on the
//! hardware thread, as they would from the device.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::HalError;
use crate::hal::{
    CodecListener, CodecService, ColorFormatConstants, DecoderMetadata, EncoderMetadata, HwCodec,
    InputBuffer, NativeConverter,
};
use crate::session::lock;
use crate::video::convert::{FrameGeometry, SoftwareLayout, deinterleave};
use crate::video::reframe::START_CODE;
use crate::video::{CropRect, EncodedData, RawFrame, VideoCodec};

pub const LUMA_FILL: u8 = 0x40;
pub const CB_FILL: u8 = 0x60;
pub const CR_FILL: u8 = 0xa0;

/// Where and how decoded frames are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct OutputLayout {
    pub color_format: u32,
    pub stride: u32,
    pub slice_height: u32,
    pub crop: CropRect,
}

impl OutputLayout {
    pub fn new(color_format: u32, width: u32, height: u32) -> Self {
        Self {
            color_format,
            stride: width,
            slice_height: height,
            crop: CropRect::new(0, 0, width, height),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoopbackConfig {
    pub decoders: Vec<VideoCodec>,
    pub encoders: Vec<VideoCodec>,
    /// Encoder input formats, most preferred first.
    pub color_formats: Vec<u32>,
    pub output: OutputLayout,
    /// Offer a service-side converter instead of the software ones.
    pub native_converter: bool,
    pub queue_depth: usize,
    /// Keep decoded frames until a drain and then emit them newest first.
    pub hold_output: bool,
    pub flush_on_drain: bool,
    pub eos_on_drain: bool,
    pub fail_start: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        let constants = ColorFormatConstants::default();
        Self {
            decoders: VideoCodec::ALL.to_vec(),
            encoders: vec![VideoCodec::H264],
            color_formats: vec![constants.yuv420_semi_planar, constants.yuv420_planar],
            output: OutputLayout::new(constants.yuv420_semi_planar, 64, 64),
            native_converter: false,
            queue_depth: 4,
            hold_output: false,
            flush_on_drain: true,
            eos_on_drain: false,
            fail_start: false,
        }
    }
}

/// A copy of one input as the hardware saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedInput {
    pub data: Vec<u8>,
    pub timestamp: i64,
    pub sync: bool,
}

pub struct LoopbackService {
    config: LoopbackConfig,
    codecs: Mutex<Vec<Arc<LoopbackCodec>>>,
    decoder_requests: Mutex<Vec<DecoderMetadata>>,
    encoder_requests: Mutex<Vec<EncoderMetadata>>,
}

impl LoopbackService {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            codecs: Mutex::new(Vec::new()),
            decoder_requests: Mutex::new(Vec::new()),
            encoder_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Every codec handle created so far, oldest first.
    pub fn codecs(&self) -> Vec<Arc<LoopbackCodec>> {
        lock(&self.codecs).clone()
    }

    pub fn created_count(&self) -> usize {
        lock(&self.codecs).len()
    }

    /// Metadata of every decoder creation request, in order.
    pub fn decoder_requests(&self) -> Vec<DecoderMetadata> {
        lock(&self.decoder_requests).clone()
    }

    pub fn encoder_requests(&self) -> Vec<EncoderMetadata> {
        lock(&self.encoder_requests).clone()
    }

    pub fn latest(&self) -> Option<Arc<LoopbackCodec>> {
        lock(&self.codecs).last().cloned()
    }

    fn register(&self, codec: LoopbackCodec) -> Arc<dyn HwCodec> {
        let codec = Arc::new(codec);
        lock(&self.codecs).push(Arc::clone(&codec));
        codec
    }
}

impl CodecService for LoopbackService {
    fn is_supported(&self, codec: VideoCodec, encoder: bool) -> bool {
        if encoder {
            self.config.encoders.contains(&codec)
        } else {
            self.config.decoders.contains(&codec)
        }
    }

    fn create_decoder(&self, metadata: &DecoderMetadata) -> Result<Arc<dyn HwCodec>, HalError> {
        if !self.is_supported(metadata.codec, false) {
            return Err(HalError::Create(metadata.codec.mime_type().to_string()));
        }
        debug!(mime = metadata.codec.mime_type(), "Creating loopback decoder");
        lock(&self.decoder_requests).push(metadata.clone());
        Ok(self.register(LoopbackCodec::new(
            Role::Decoder,
            metadata.codec,
            &self.config,
        )))
    }

    fn create_encoder(&self, metadata: &EncoderMetadata) -> Result<Arc<dyn HwCodec>, HalError> {
        if !self.is_supported(metadata.codec, true) {
            return Err(HalError::Create(metadata.codec.mime_type().to_string()));
        }
        debug!(mime = metadata.codec.mime_type(), "Creating loopback encoder");
        lock(&self.encoder_requests).push(metadata.clone());
        Ok(self.register(LoopbackCodec::new(
            Role::Encoder,
            metadata.codec,
            &self.config,
        )))
    }

    fn supported_color_formats(&self, codec: VideoCodec) -> Vec<u32> {
        if self.is_supported(codec, true) {
            self.config.color_formats.clone()
        } else {
            Vec::new()
        }
    }

    fn create_converter(&self) -> Option<Box<dyn NativeConverter>> {
        if self.config.native_converter {
            Some(Box::new(LoopbackConverter::default()))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Decoder,
    Encoder,
}

enum Command {
    Input(InputBuffer),
    Drain,
}

type ListenerSlot = Arc<Mutex<Option<Arc<dyn CodecListener>>>>;

#[derive(Default)]
struct Lifecycle {
    tx: Option<SyncSender<Command>>,
    thread: Option<JoinHandle<()>>,
    started: bool,
    destroyed: bool,
}

pub struct LoopbackCodec {
    role: Role,
    codec: VideoCodec,
    queue_depth: usize,
    fail_start: bool,
    behaviour: Behaviour,
    listener: ListenerSlot,
    output: Arc<Mutex<OutputLayout>>,
    queued: Arc<Mutex<Vec<QueuedInput>>>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Debug, Clone, Copy)]
struct Behaviour {
    hold_output: bool,
    flush_on_drain: bool,
    eos_on_drain: bool,
}

impl LoopbackCodec {
    fn new(role: Role, codec: VideoCodec, config: &LoopbackConfig) -> Self {
        Self {
            role,
            codec,
            queue_depth: config.queue_depth.max(1),
            fail_start: config.fail_start,
            behaviour: Behaviour {
                hold_output: config.hold_output,
                flush_on_drain: config.flush_on_drain,
                eos_on_drain: config.eos_on_drain,
            },
            listener: Arc::new(Mutex::new(None)),
            output: Arc::new(Mutex::new(config.output)),
            queued: Arc::new(Mutex::new(Vec::new())),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn is_encoder(&self) -> bool {
        self.role == Role::Encoder
    }

    /// Inputs the hardware thread has consumed, in order.
    pub fn queued_inputs(&self) -> Vec<QueuedInput> {
        lock(&self.queued).clone()
    }

    pub fn has_listener(&self) -> bool {
        lock(&self.listener).is_some()
    }

    pub fn is_started(&self) -> bool {
        lock(&self.lifecycle).started
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.lifecycle).destroyed
    }

    /// Changes the layout of frames decoded from now on.
    pub fn set_output_layout(&self, layout: OutputLayout) {
        *lock(&self.output) = layout;
    }

    pub fn emit_size_changed(&self, width: u32, height: u32) {
        if let Some(listener) = current(&self.listener) {
            listener.on_size_changed(width, height);
        }
    }

    pub fn emit_error(&self, code: i32) {
        if let Some(listener) = current(&self.listener) {
            listener.on_error(code);
        }
    }

    pub fn emit_end_of_stream(&self) {
        if let Some(listener) = current(&self.listener) {
            listener.on_end_of_stream();
        }
    }

    fn shut_down_thread(&self) {
        let (tx, thread) = {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.started = false;
            (lifecycle.tx.take(), lifecycle.thread.take())
        };
        drop(tx);
        if let Some(thread) = thread
            && thread.join().is_err()
        {
            warn!("Loopback hardware thread panicked");
        }
    }
}

impl HwCodec for LoopbackCodec {
    fn set_listener(&self, listener: Option<Arc<dyn CodecListener>>) {
        *lock(&self.listener) = listener;
    }

    fn start(&self) -> Result<(), HalError> {
        if self.fail_start {
            return Err(HalError::Start);
        }
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.started {
            return Ok(());
        }
        let (tx, rx) = mpsc::sync_channel(self.queue_depth);
        let worker = HardwareThread {
            role: self.role,
            codec: self.codec,
            behaviour: self.behaviour,
            listener: Arc::clone(&self.listener),
            output: Arc::clone(&self.output),
            queued: Arc::clone(&self.queued),
            held: Vec::new(),
        };
        let thread = thread::Builder::new()
            .name("loopback-hw".to_string())
            .spawn(move || worker.run(rx))
            .map_err(|_| HalError::Start)?;
        lifecycle.tx = Some(tx);
        lifecycle.thread = Some(thread);
        lifecycle.started = true;
        Ok(())
    }

    fn queue(&self, buffer: InputBuffer) {
        let tx = lock(&self.lifecycle).tx.clone();
        match tx {
            Some(tx) => {
                if tx.send(Command::Input(buffer)).is_err() {
                    warn!("Loopback codec stopped; input dropped");
                }
            }
            None => warn!("Loopback codec not started; input dropped"),
        }
    }

    fn drain(&self) {
        let tx = lock(&self.lifecycle).tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(Command::Drain);
        }
    }

    fn stop(&self) {
        self.shut_down_thread();
    }

    fn destroy(&self) {
        self.shut_down_thread();
        lock(&self.lifecycle).destroyed = true;
    }
}

fn current(slot: &ListenerSlot) -> Option<Arc<dyn CodecListener>> {
    lock(slot).clone()
}

struct HardwareThread {
    role: Role,
    codec: VideoCodec,
    behaviour: Behaviour,
    listener: ListenerSlot,
    output: Arc<Mutex<OutputLayout>>,
    queued: Arc<Mutex<Vec<QueuedInput>>>,
    held: Vec<RawFrame>,
}

impl HardwareThread {
    fn run(mut self, rx: Receiver<Command>) {
        for command in rx {
            match command {
                Command::Input(buffer) => self.consume(buffer),
                Command::Drain => self.drain(),
            }
        }
        if !self.held.is_empty() {
            debug!(held = self.held.len(), "Dropping held frames on stop");
        }
    }

    fn consume(&mut self, buffer: InputBuffer) {
        let timestamp = buffer.timestamp();
        let sync = buffer.is_sync();
        let input = buffer.data().to_vec();
        buffer.release();

        lock(&self.queued).push(QueuedInput {
            data: input.clone(),
            timestamp,
            sync,
        });

        match self.role {
            Role::Decoder => {
                let frame = render_frame(&lock(&self.output), timestamp);
                if self.behaviour.hold_output {
                    self.held.push(frame);
                } else if let Some(listener) = current(&self.listener) {
                    listener.on_frame_decoded(frame);
                }
            }
            Role::Encoder => {
                let data = EncodedData {
                    data: synthetic_bitstream(self.codec, sync, input.len()),
                    timestamp_ns: timestamp * 1000,
                    key_frame: sync,
                };
                if let Some(listener) = current(&self.listener) {
                    listener.on_data_available(data);
                }
            }
        }
    }

    fn drain(&mut self) {
        if self.behaviour.flush_on_drain {
            let held = std::mem::take(&mut self.held);
            for frame in held.into_iter().rev() {
                if let Some(listener) = current(&self.listener) {
                    listener.on_frame_decoded(frame);
                }
            }
        }
        if self.behaviour.eos_on_drain
            && let Some(listener) = current(&self.listener)
        {
            listener.on_end_of_stream();
        }
    }
}

/// A flat-coloured frame laid out the way the hardware format demands.
fn render_frame(layout: &OutputLayout, timestamp: i64) -> RawFrame {
    let geometry = FrameGeometry {
        stride: layout.stride,
        slice_height: layout.slice_height,
        top: layout.crop.top,
        left: layout.crop.left,
        width: layout.crop.width(),
        height: layout.crop.height(),
    };
    let software = SoftwareLayout::from_color_format(
        layout.color_format,
        &ColorFormatConstants::default(),
    );
    let aligned = software.map_or(geometry, |software| software.align(geometry));
    let luma = aligned.stride as usize * aligned.slice_height as usize;

    let mut data = vec![LUMA_FILL; luma];
    match software {
        Some(SoftwareLayout::Planar) => {
            data.extend(std::iter::repeat_n(CB_FILL, luma / 4));
            data.extend(std::iter::repeat_n(CR_FILL, luma / 4));
        }
        _ => {
            for _ in 0..luma / 4 {
                data.push(CB_FILL);
                data.push(CR_FILL);
            }
        }
    }

    RawFrame {
        data,
        timestamp_ns: timestamp * 1000,
        stride: layout.stride,
        slice_height: layout.slice_height,
        crop: layout.crop,
        color_format: layout.color_format,
    }
}

/// Annex B access unit for H.264 (parameter sets ahead of key frames), an
/// opaque payload otherwise.
fn synthetic_bitstream(codec: VideoCodec, key_frame: bool, input_len: usize) -> Vec<u8> {
    let payload = 8 + input_len % 8;
    match codec {
        VideoCodec::H264 => {
            let mut out = Vec::new();
            if key_frame {
                out.extend_from_slice(&START_CODE);
                out.extend_from_slice(&[0x67, 0x42, 0xc0, 0x1e]);
                out.extend_from_slice(&START_CODE);
                out.extend_from_slice(&[0x68, 0xce, 0x3c, 0x80]);
            }
            out.extend_from_slice(&START_CODE);
            out.push(if key_frame { 0x65 } else { 0x41 });
            out.extend(std::iter::repeat_n(0x88, payload));
            out
        }
        VideoCodec::Vp8 | VideoCodec::Vp9 => {
            let mut out = vec![0x9d, 0x01, 0x2a];
            out.extend(std::iter::repeat_n(0x5a, payload));
            out
        }
    }
}

/// Crops an NV12 buffer straight into I420.
#[derive(Debug, Default)]
pub struct LoopbackConverter {
    crop: CropRect,
    stride: u32,
    slice_height: u32,
}

impl NativeConverter for LoopbackConverter {
    fn set_crop_rect(&mut self, crop: CropRect, stride: u32, slice_height: u32) {
        self.crop = crop;
        self.stride = stride;
        self.slice_height = slice_height;
    }

    fn convert_to_i420(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), HalError> {
        let width = self.crop.width() as usize;
        let height = self.crop.height() as usize;
        let stride = self.stride as usize;
        let (top, left) = (self.crop.top as usize, self.crop.left as usize);
        let luma = width * height;
        if output.len() < luma * 3 / 2 {
            return Err(HalError::Convert(format!(
                "output holds {} bytes, {} needed",
                output.len(),
                luma * 3 / 2
            )));
        }

        let (y_out, chroma_out) = output.split_at_mut(luma);
        let (u_out, v_out) = chroma_out.split_at_mut(luma / 4);
        for row in 0..height {
            let src = (top + row) * stride + left;
            let line = input
                .get(src..src + width)
                .ok_or_else(|| HalError::Convert(format!("luma row {row} out of bounds")))?;
            y_out[row * width..(row + 1) * width].copy_from_slice(line);
        }

        let chroma_base = stride * self.slice_height as usize;
        let chroma_width = width / 2;
        for row in 0..height / 2 {
            let src = chroma_base + (top / 2 + row) * stride + (left / 2) * 2;
            let line = input
                .get(src..src + chroma_width * 2)
                .ok_or_else(|| HalError::Convert(format!("chroma row {row} out of bounds")))?;
            let dst = row * chroma_width..(row + 1) * chroma_width;
            deinterleave(&mut u_out[dst.clone()], &mut v_out[dst], line);
        }
        Ok(())
    }
}
