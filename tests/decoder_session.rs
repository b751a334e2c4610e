mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{Event, Recorder, WAIT, coded, harness, settle, wait_off_main_loop};
use gmp_hwcodec::hal::ColorFormatConstants;
use gmp_hwcodec::hal::loopback::{CB_FILL, CR_FILL, LUMA_FILL, LoopbackConfig, OutputLayout};
use gmp_hwcodec::host::HeapAllocator;
use gmp_hwcodec::video::{BufferFraming, CodedFrame, CropRect, StreamConfig, VideoCodec};
use gmp_hwcodec::{CodecError, DecoderSession, ErrorCode, SessionState};

#[test]
fn configure_then_shutdown_opens_no_codec() -> Result<()> {
    let (service, main, main_loop) = harness(LoopbackConfig::default());
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));

    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;
    assert_eq!(session.state(), SessionState::Configured);
    session.shutdown();
    settle(&main_loop);

    assert_eq!(service.created_count(), 0);
    assert!(recorder.events().is_empty());
    assert_eq!(session.state(), SessionState::ShuttingDown);
    Ok(())
}

#[test]
fn decoded_frames_carry_submitted_durations() -> Result<()> {
    let (service, main, main_loop) = harness(LoopbackConfig::default());
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    for (index, timestamp) in [0, 33_333, 66_666].into_iter().enumerate() {
        session.submit(coded(timestamp, 33_000 + index as u64))?;
    }
    assert!(main_loop.run_until(WAIT, || recorder.decoded_count() == 3));

    let decoded: Vec<_> = recorder
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Decoded { .. }))
        .collect();
    assert_eq!(
        decoded,
        vec![
            Event::Decoded { timestamp: 0, duration: 33_000 },
            Event::Decoded { timestamp: 33_333, duration: 33_001 },
            Event::Decoded { timestamp: 66_666, duration: 33_002 },
        ]
    );
    assert!(recorder.has(&Event::InputDataExhausted));
    assert_eq!(session.in_flight(), 0);
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(session.converter_name(), Some("semi-planar"));

    let frame = &recorder.frames()[0];
    assert_eq!((frame.width, frame.height), (64, 64));
    assert!(frame.y.data.iter().all(|b| *b == LUMA_FILL));
    assert!(frame.u.data.iter().all(|b| *b == CB_FILL));
    assert!(frame.v.data.iter().all(|b| *b == CR_FILL));

    session.shutdown();
    let metrics = session.metrics();
    assert_eq!(metrics.frames_submitted, 3);
    assert_eq!(metrics.inputs_released, 3);
    assert_eq!(service.created_count(), 1);
    Ok(())
}

#[test]
fn held_frames_return_in_reverse_with_matching_durations() -> Result<()> {
    let config = LoopbackConfig {
        hold_output: true,
        ..LoopbackConfig::default()
    };
    let (service, main, main_loop) = harness(config);
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp9, 64, 64), recorder.clone())?;

    for index in 0..4i64 {
        session.submit(coded(index * 1_000, 500 + index as u64))?;
    }
    assert!(main_loop.run_until(WAIT, || {
        service
            .latest()
            .is_some_and(|codec| codec.queued_inputs().len() == 4)
    }));
    assert_eq!(recorder.decoded_count(), 0);
    assert_eq!(session.in_flight(), 4);

    session.drain();
    assert!(main_loop.run_until(WAIT, || recorder.has(&Event::DrainComplete)));
    settle(&main_loop);

    let events = recorder.events();
    let decoded: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::Decoded { timestamp, duration } => Some((*timestamp, *duration)),
            _ => None,
        })
        .collect();
    assert_eq!(decoded, vec![(3_000, 503), (2_000, 502), (1_000, 501), (0, 500)]);

    let drain_at = events.iter().position(|e| *e == Event::DrainComplete).unwrap();
    let last_decoded = events
        .iter()
        .rposition(|e| matches!(e, Event::Decoded { .. }))
        .unwrap();
    assert!(drain_at > last_decoded);
    assert_eq!(recorder.count(|e| *e == Event::DrainComplete), 1);
    assert_eq!(session.in_flight(), 0);
    Ok(())
}

#[test]
fn drain_completes_immediately_when_nothing_submitted() -> Result<()> {
    let (service, main, main_loop) = harness(LoopbackConfig::default());
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    session.drain();
    assert!(main_loop.run_until(WAIT, || recorder.has(&Event::DrainComplete)));
    assert_eq!(service.created_count(), 0);
    Ok(())
}

#[test]
fn drain_after_all_output_completes_immediately() -> Result<()> {
    let (service, main, main_loop) = harness(LoopbackConfig::default());
    let recorder = Recorder::new();
    let session = DecoderSession::new(service, main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    session.submit(coded(0, 10))?;
    assert!(main_loop.run_until(WAIT, || recorder.decoded_count() == 1));
    session.drain();
    assert!(main_loop.run_until(WAIT, || recorder.has(&Event::DrainComplete)));
    settle(&main_loop);
    assert_eq!(recorder.count(|e| *e == Event::DrainComplete), 1);
    Ok(())
}

#[test]
fn reset_twice_reports_once_and_reopens_on_next_frame() -> Result<()> {
    let (service, main, main_loop) = harness(LoopbackConfig::default());
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    session.submit(coded(0, 10))?;
    session.submit(coded(10, 10))?;
    assert!(main_loop.run_until(WAIT, || recorder.decoded_count() == 2));

    session.reset();
    session.reset();
    assert!(main_loop.run_until(WAIT, || recorder.has(&Event::ResetComplete)));
    settle(&main_loop);
    assert_eq!(recorder.count(|e| *e == Event::ResetComplete), 1);

    let first = service.latest().unwrap();
    assert!(first.is_destroyed());
    assert!(!first.has_listener());
    assert!(!session.has_codec());
    assert_eq!(session.state(), SessionState::Configured);
    assert_eq!(session.converter_name(), None);

    session.submit(coded(20, 10))?;
    assert!(main_loop.run_until(WAIT, || recorder.decoded_count() == 3));
    assert_eq!(service.created_count(), 2);
    Ok(())
}

#[test]
fn reset_discards_held_output() -> Result<()> {
    let config = LoopbackConfig {
        hold_output: true,
        ..LoopbackConfig::default()
    };
    let (service, main, main_loop) = harness(config);
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    for index in 0..3i64 {
        session.submit(coded(index, 1))?;
    }
    assert!(main_loop.run_until(WAIT, || {
        service
            .latest()
            .is_some_and(|codec| codec.queued_inputs().len() == 3)
    }));

    session.reset();
    assert!(main_loop.run_until(WAIT, || recorder.has(&Event::ResetComplete)));

    let metrics = session.metrics();
    assert_eq!(recorder.decoded_count(), 0);
    assert_eq!(metrics.frames_output, 3);
    assert_eq!(metrics.frames_decoded + metrics.frames_discarded, metrics.frames_output);
    assert_eq!(session.in_flight(), 0);
    Ok(())
}

#[test]
fn shutdown_with_held_frames_delivers_nothing() -> Result<()> {
    let config = LoopbackConfig {
        hold_output: true,
        ..LoopbackConfig::default()
    };
    let (service, main, main_loop) = harness(config);
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::H264, 64, 64), recorder.clone())?;

    for index in 0..3i64 {
        session.submit(coded(index * 40, 40))?;
    }
    assert!(main_loop.run_until(WAIT, || {
        service
            .latest()
            .is_some_and(|codec| codec.queued_inputs().len() == 3)
    }));

    session.shutdown();
    settle(&main_loop);

    let metrics = session.metrics();
    assert_eq!(recorder.decoded_count(), 0);
    assert_eq!(metrics.frames_discarded, 3);
    assert_eq!(metrics.inputs_released, metrics.frames_submitted);
    assert!(service.latest().unwrap().is_destroyed());
    assert!(matches!(session.submit(coded(500, 1)), Err(CodecError::Generic(_))));
    Ok(())
}

#[test]
fn unsupported_codec_is_rejected_and_reported() -> Result<()> {
    let config = LoopbackConfig {
        decoders: vec![VideoCodec::H264],
        ..LoopbackConfig::default()
    };
    let (service, main, main_loop) = harness(config);
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));

    let result = session.configure(&StreamConfig::new(VideoCodec::Vp9, 64, 64), recorder.clone());
    assert!(matches!(result, Err(CodecError::Unsupported(_))));
    main_loop.run_pending();
    assert_eq!(recorder.events(), vec![Event::Error(ErrorCode::Unsupported)]);
    assert_eq!(service.created_count(), 0);
    Ok(())
}

#[test]
fn zero_dimensions_are_invalid() {
    let (service, main, _main_loop) = harness(LoopbackConfig::default());
    let session = DecoderSession::new(service, main, Arc::new(HeapAllocator));
    let result = session.configure(&StreamConfig::new(VideoCodec::Vp8, 0, 480), Recorder::new());
    assert!(matches!(result, Err(CodecError::InvalidArgument(_))));
}

#[test]
fn submit_before_configure_is_invalid() {
    let (service, main, _main_loop) = harness(LoopbackConfig::default());
    let session = DecoderSession::new(service, main, Arc::new(HeapAllocator));
    assert!(matches!(session.submit(coded(0, 1)), Err(CodecError::InvalidArgument(_))));
}

#[test]
fn unknown_output_format_reports_decode_error() -> Result<()> {
    let config = LoopbackConfig {
        output: OutputLayout::new(0x7f00_0001, 64, 64),
        ..LoopbackConfig::default()
    };
    let (service, main, main_loop) = harness(config);
    let recorder = Recorder::new();
    let session = DecoderSession::new(service, main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    session.submit(coded(0, 1))?;
    assert!(main_loop.run_until(WAIT, || recorder.has(&Event::Error(ErrorCode::DecodeError))));
    assert_eq!(recorder.decoded_count(), 0);
    assert_eq!(session.converter_name(), None);
    assert_eq!(session.metrics().frames_discarded, 1);
    Ok(())
}

#[test]
fn size_change_selects_a_new_converter() -> Result<()> {
    let (service, main, main_loop) = harness(LoopbackConfig::default());
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    session.submit(coded(0, 1))?;
    assert!(main_loop.run_until(WAIT, || recorder.decoded_count() == 1));
    assert_eq!(session.converter_name(), Some("semi-planar"));

    let codec = service.latest().unwrap();
    let planar = ColorFormatConstants::default().yuv420_planar;
    codec.set_output_layout(OutputLayout::new(planar, 32, 32));
    codec.emit_size_changed(32, 32);

    session.submit(coded(1, 1))?;
    assert!(main_loop.run_until(WAIT, || recorder.decoded_count() == 2));
    assert_eq!(session.converter_name(), Some("planar"));

    let frame = recorder.frames().pop().unwrap();
    assert_eq!((frame.width, frame.height), (32, 32));
    assert!(frame.u.data.iter().all(|b| *b == CB_FILL));
    assert!(frame.v.data.iter().all(|b| *b == CR_FILL));
    Ok(())
}

#[test]
fn native_converter_is_preferred_and_crops() -> Result<()> {
    let config = LoopbackConfig {
        native_converter: true,
        output: OutputLayout {
            crop: CropRect::new(2, 2, 32, 32),
            ..OutputLayout::new(ColorFormatConstants::default().yuv420_semi_planar, 64, 64)
        },
        ..LoopbackConfig::default()
    };
    let (service, main, main_loop) = harness(config);
    let recorder = Recorder::new();
    let session = DecoderSession::new(service, main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    session.submit(coded(0, 1))?;
    assert!(main_loop.run_until(WAIT, || recorder.decoded_count() == 1));
    assert_eq!(session.converter_name(), Some("native"));

    let frame = &recorder.frames()[0];
    assert_eq!((frame.width, frame.height), (32, 32));
    assert_eq!(frame.y.data.len(), 32 * 32);
    assert!(frame.y.data.iter().all(|b| *b == LUMA_FILL));
    assert_eq!(frame.u.data.len(), 16 * 16);
    assert!(frame.v.data.iter().all(|b| *b == CR_FILL));
    Ok(())
}

#[test]
fn h264_length_prefixed_input_reaches_codec_with_start_codes() -> Result<()> {
    let (service, main, main_loop) = harness(LoopbackConfig::default());
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));

    let mut config = StreamConfig::new(VideoCodec::H264, 64, 64);
    config.codec_data = vec![0x01, 0x01, 0x42, 0xc0, 0x1e];
    config.max_framerate = Some(30);
    session.configure(&config, recorder.clone())?;

    session.submit(CodedFrame {
        data: vec![0, 0, 0, 3, 0x65, 0x11, 0x22, 0, 0, 0, 2, 0x41, 0x33],
        timestamp: 0,
        duration: 1,
        key_frame: true,
        framing: BufferFraming::Length32,
    })?;
    assert!(main_loop.run_until(WAIT, || recorder.decoded_count() == 1));

    let codec = service.latest().unwrap();
    assert_eq!(
        codec.queued_inputs()[0].data,
        vec![0, 0, 0, 1, 0x65, 0x11, 0x22, 0, 0, 0, 1, 0x41, 0x33]
    );
    assert!(codec.queued_inputs()[0].sync);

    let request = &service.decoder_requests()[0];
    assert_eq!(request.codec_data, vec![0x01, 0x42, 0xc0, 0x1e]);
    assert_eq!(request.fps, Some(30));
    assert!(request.hardware_only);
    assert!(request.no_media_buffer);
    Ok(())
}

#[test]
fn end_of_stream_completes_pending_drain() -> Result<()> {
    let config = LoopbackConfig {
        hold_output: true,
        flush_on_drain: false,
        eos_on_drain: true,
        ..LoopbackConfig::default()
    };
    let (service, main, main_loop) = harness(config);
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    session.submit(coded(0, 1))?;
    session.submit(coded(1, 1))?;
    assert!(main_loop.run_until(WAIT, || {
        service
            .latest()
            .is_some_and(|codec| codec.queued_inputs().len() == 2)
    }));

    session.drain();
    assert!(main_loop.run_until(WAIT, || recorder.has(&Event::DrainComplete)));
    settle(&main_loop);
    assert_eq!(recorder.count(|e| *e == Event::DrainComplete), 1);
    assert_eq!(recorder.decoded_count(), 0);
    assert_eq!(session.in_flight(), 0);
    Ok(())
}

#[test]
fn start_failure_destroys_handle_and_reports() -> Result<()> {
    let config = LoopbackConfig {
        fail_start: true,
        ..LoopbackConfig::default()
    };
    let (service, main, main_loop) = harness(config);
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    session.submit(coded(0, 1))?;
    assert!(main_loop.run_until(WAIT, || recorder.has(&Event::Error(ErrorCode::DecodeError))));
    let codec = service.latest().unwrap();
    assert!(codec.is_destroyed());
    assert!(!codec.has_listener());
    assert!(!session.has_codec());
    assert_eq!(session.in_flight(), 0);
    Ok(())
}

#[test]
fn hardware_error_is_reported_as_decode_error() -> Result<()> {
    let (service, main, main_loop) = harness(LoopbackConfig::default());
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    session.submit(coded(0, 1))?;
    assert!(main_loop.run_until(WAIT, || recorder.decoded_count() == 1));
    service.latest().unwrap().emit_error(-38);
    assert!(main_loop.run_until(WAIT, || recorder.has(&Event::Error(ErrorCode::DecodeError))));
    Ok(())
}

#[test]
fn dropping_the_session_closes_the_codec() -> Result<()> {
    let (service, main, main_loop) = harness(LoopbackConfig::default());
    let recorder = Recorder::new();
    {
        let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
        session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;
        session.submit(coded(0, 1))?;
        assert!(main_loop.run_until(WAIT, || recorder.decoded_count() == 1));
    }
    settle(&main_loop);
    let codec = service.latest().unwrap();
    assert!(codec.is_destroyed());
    assert!(!codec.has_listener());
    Ok(())
}

#[test]
fn end_of_stream_without_drain_still_reports_drain_complete() -> Result<()> {
    let (service, main, main_loop) = harness(LoopbackConfig::default());
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    session.submit(coded(0, 1))?;
    assert!(main_loop.run_until(WAIT, || recorder.decoded_count() == 1));
    service.latest().unwrap().emit_end_of_stream();
    settle(&main_loop);

    assert_eq!(recorder.count(|e| *e == Event::DrainComplete), 1);
    assert_eq!(session.in_flight(), 0);
    Ok(())
}

#[test]
fn end_of_stream_on_drain_completes_only_once() -> Result<()> {
    let config = LoopbackConfig {
        eos_on_drain: true,
        ..LoopbackConfig::default()
    };
    let (service, main, main_loop) = harness(config);
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    session.submit(coded(0, 1))?;
    session.submit(coded(1, 1))?;
    session.drain();
    assert!(main_loop.run_until(WAIT, || recorder.has(&Event::DrainComplete)));
    settle(&main_loop);
    assert_eq!(recorder.count(|e| *e == Event::DrainComplete), 1);
    assert_eq!(session.in_flight(), 0);
    Ok(())
}

#[test]
fn reset_during_delivery_waits_for_the_frame() -> Result<()> {
    let (service, main, main_loop) = harness(LoopbackConfig::default());
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    session.submit(coded(0, 1))?;
    assert!(wait_off_main_loop(|| {
        service
            .latest()
            .is_some_and(|codec| codec.queued_inputs().len() == 1)
    }));
    session.reset();
    session.reset();
    assert_eq!(session.state(), SessionState::Resetting);

    assert!(main_loop.run_until(WAIT, || recorder.has(&Event::ResetComplete)));
    settle(&main_loop);
    assert_eq!(recorder.count(|e| *e == Event::ResetComplete), 1);
    assert_eq!(recorder.decoded_count(), 0);
    assert_eq!(session.metrics().frames_discarded, 1);

    let codec = service.latest().unwrap();
    assert!(codec.is_destroyed());
    assert!(!codec.has_listener());
    assert!(!session.has_codec());
    assert_eq!(session.state(), SessionState::Configured);
    Ok(())
}

#[test]
fn shutdown_during_delivery_waits_for_the_frame() -> Result<()> {
    let (service, main, main_loop) = harness(LoopbackConfig::default());
    let recorder = Recorder::new();
    let session = DecoderSession::new(service.clone(), main, Arc::new(HeapAllocator));
    session.configure(&StreamConfig::new(VideoCodec::Vp8, 64, 64), recorder.clone())?;

    session.submit(coded(0, 1))?;
    assert!(wait_off_main_loop(|| {
        service
            .latest()
            .is_some_and(|codec| codec.queued_inputs().len() == 1)
    }));
    session.shutdown();

    let codec = service.latest().unwrap();
    assert!(main_loop.run_until(WAIT, || codec.is_destroyed()));
    settle(&main_loop);
    assert!(recorder.events().is_empty());
    assert!(!codec.has_listener());
    assert!(!session.has_codec());
    assert_eq!(session.state(), SessionState::ShuttingDown);
    Ok(())
}
