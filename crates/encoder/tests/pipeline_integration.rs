//! End-to-end tests: the full pipeline driven against the in-memory sink,
//! kernel provider and descriptor heap.

use std::sync::Arc;
use std::thread;

use crossbeam::channel;

use kp_common::config::{PipelineConfig, RateControlMode, SequenceParams};
use kp_common::device::{CompletionTag, SurfaceHandle};
use kp_common::error::{ExhaustedResource, PipelineError};
use kp_common::kernel::BrcKernel;
use kp_common::load::pipeline_config_from_json;
use kp_common::types::{FrameNumber, PictureCodingType, PictureStructure, RefList, ScaleFactor};
use kp_encoder::frame::{
    FrameSurfaces, MbRect, PictureId, PictureRef, PictureSurfaces, RoiRegion, WeightedPrediction,
};
use kp_encoder::software::{DispatchLog, InMemoryKernelProvider, LinearDescriptorHeap, RecordingSink};
use kp_encoder::{
    BrcFrameInput, EncodePipeline, FrameContext, FrameReport, FrameStatistics, RcState, StageId, StageKind,
};

const HEAP_SLOTS: u32 = 4096;

fn make_picture(id: u32) -> PictureRef {
    let base = 1000 + u64::from(id) * 10;
    PictureRef {
        id: PictureId(id),
        version: 1,
        surfaces: PictureSurfaces {
            raw: SurfaceHandle(base),
            scaled_4x: SurfaceHandle(base + 1),
            scaled_16x: SurfaceHandle(base + 2),
            scaled_32x: SurfaceHandle(base + 3),
        },
    }
}

fn make_surfaces() -> FrameSurfaces {
    FrameSurfaces {
        me_mv_32x: SurfaceHandle(1),
        me_mv_16x: SurfaceHandle(2),
        me_mv_4x: SurfaceHandle(3),
        me_distortion: SurfaceHandle(4),
        mb_code: SurfaceHandle(5),
        mv_data: SurfaceHandle(6),
        brc_history: SurfaceHandle(7),
        brc_distortion: SurfaceHandle(8),
        brc_image_state: SurfaceHandle(9),
        pak_statistics: SurfaceHandle(10),
        mb_qp: None,
        weighted_l0: vec![SurfaceHandle(100), SurfaceHandle(101)],
        weighted_l1: vec![SurfaceHandle(200)],
        external_mv: None,
    }
}

fn make_ctx(frame: u64, coding_type: PictureCodingType, current: u32, l0: &[u32], l1: &[u32]) -> FrameContext {
    FrameContext {
        frame: FrameNumber(frame),
        coding_type,
        structure: PictureStructure::Frame,
        first_field: true,
        current: make_picture(current),
        recon: SurfaceHandle(900 + u64::from(current)),
        l0: l0.iter().copied().map(make_picture).collect(),
        l1: l1.iter().copied().map(make_picture).collect(),
        weights: WeightedPrediction::default(),
        direct_spatial: true,
        is_reference: true,
        pic_init_qp: 26,
        slice_qp_delta: 0,
        roi: vec![],
        dirty_rects: vec![],
        prev_recon_is_l0_ref: false,
        surfaces: make_surfaces(),
    }
}

fn make_config() -> PipelineConfig {
    PipelineConfig {
        acquire_timeout_ms: 50,
        ..PipelineConfig::default()
    }
}

fn make_pipeline(config: &PipelineConfig, sink: RecordingSink) -> EncodePipeline {
    EncodePipeline::new(
        config,
        Box::new(sink),
        Arc::new(InMemoryKernelProvider::synthetic(4)),
        Box::new(LinearDescriptorHeap::new(HEAP_SLOTS)),
    )
    .unwrap()
}

fn stats_for(report: &FrameReport) -> FrameStatistics {
    FrameStatistics {
        frame: report.frame,
        bits_produced: 250_000,
        distortion: 1_000,
        skipped_mbs: 0,
        average_qp: 30,
    }
}

fn opcodes(log: &DispatchLog) -> Vec<u16> {
    log.lock().iter().map(|d| d.record.opcode).collect()
}

// ── Frame sequencing ────────────────────────────────────────────────

#[test]
fn i_then_p_frame_dispatch_in_plan_order() {
    let sink = RecordingSink::new();
    let log = sink.log();
    let mut pipeline = make_pipeline(&make_config(), sink);

    let i = make_ctx(0, PictureCodingType::I, 0, &[], &[]);
    let report = pipeline.encode_frame(&i, &BrcFrameInput::default()).unwrap();
    assert_eq!(
        report.stages,
        vec![
            StageId::BrcInitReset,
            StageId::Scale(ScaleFactor::X4),
            StageId::Scale(ScaleFactor::X16),
            StageId::SwScoreboard,
            StageId::BrcIFrameDist,
            StageId::BrcFrameUpdate,
            StageId::BrcMbUpdate,
            StageId::MbEnc,
        ]
    );
    assert_eq!(report.tags.len(), 8);
    assert!(report.gaps.is_empty());
    assert_eq!(pipeline.rate_control().state(), RcState::Steady);
    pipeline.complete_frame(&stats_for(&report)).unwrap();

    let p = make_ctx(1, PictureCodingType::P, 1, &[0], &[]);
    let report = pipeline.encode_frame(&p, &BrcFrameInput::default()).unwrap();
    assert_eq!(
        report.stages,
        vec![
            StageId::Scale(ScaleFactor::X4),
            StageId::Scale(ScaleFactor::X16),
            StageId::Me(ScaleFactor::X16),
            StageId::Me(ScaleFactor::X4),
            StageId::SwScoreboard,
            StageId::BrcFrameUpdate,
            StageId::BrcMbUpdate,
            StageId::MbEnc,
        ]
    );

    let log = log.lock();
    assert_eq!(log.len(), 16);
    // Only the last stage of each frame carries the final flag.
    let finals: Vec<usize> = log
        .iter()
        .enumerate()
        .filter(|(_, d)| d.record.is_final())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(finals, vec![7, 15]);
    assert_eq!(log[7].record.opcode, StageKind::MbEnc.opcode());
    // Tags are handed out in submission order.
    assert!(log.windows(2).all(|w| w[0].tag.0 < w[1].tag.0));
    // Records describe the blocks and bindings they travel with.
    for dispatch in log.iter() {
        assert!(dispatch.record.parameter_size as usize <= dispatch.parameters.len());
        assert_eq!(dispatch.record.binding_count as usize, dispatch.bindings.len());
    }
}

#[test]
fn brc_frame_update_ships_constant_data() {
    let sink = RecordingSink::new();
    let log = sink.log();
    let mut pipeline = make_pipeline(&make_config(), sink);
    pipeline
        .encode_frame(&make_ctx(0, PictureCodingType::I, 0, &[], &[]), &BrcFrameInput::default())
        .unwrap();

    let log = log.lock();
    for dispatch in log.iter() {
        if dispatch.record.opcode == StageKind::BrcFrameUpdate.opcode() {
            assert!(!dispatch.constant_data.is_empty());
        } else {
            assert!(dispatch.constant_data.is_empty());
        }
    }
}

#[test]
fn b_frame_searches_both_lists() {
    let sink = RecordingSink::new();
    let log = sink.log();
    let mut pipeline = make_pipeline(&make_config(), sink);

    let frames = [
        make_ctx(0, PictureCodingType::I, 0, &[], &[]),
        make_ctx(1, PictureCodingType::P, 1, &[0], &[]),
    ];
    for ctx in &frames {
        let report = pipeline.encode_frame(ctx, &BrcFrameInput::default()).unwrap();
        pipeline.complete_frame(&stats_for(&report)).unwrap();
    }
    let before = log.lock().len();

    let b = make_ctx(2, PictureCodingType::B, 2, &[0], &[1]);
    let report = pipeline.encode_frame(&b, &BrcFrameInput::default()).unwrap();
    assert!(report.stages.contains(&StageId::Me(ScaleFactor::X4)));

    let log = log.lock();
    let me: Vec<_> = log[before..]
        .iter()
        .filter(|d| d.record.opcode == StageKind::Me.opcode())
        .collect();
    assert_eq!(me.len(), 2);
    // B pictures use the B variant of the motion search kernel.
    assert!(me.iter().all(|d| d.record.variant == 1));
    let handles: Vec<SurfaceHandle> = me[1].bindings.iter().map(|b| b.handle).collect();
    assert!(handles.contains(&make_picture(0).surfaces.scaled_4x));
    assert!(handles.contains(&make_picture(1).surfaces.scaled_4x));
}

#[test]
fn second_field_reuses_downscaled_copies() {
    let mut pipeline = make_pipeline(&make_config(), RecordingSink::new());
    let mut top = make_ctx(0, PictureCodingType::I, 0, &[], &[]);
    top.structure = PictureStructure::TopField;
    let report = pipeline.encode_frame(&top, &BrcFrameInput::default()).unwrap();
    pipeline.complete_frame(&stats_for(&report)).unwrap();

    let mut bottom = make_ctx(1, PictureCodingType::I, 0, &[], &[]);
    bottom.structure = PictureStructure::BottomField;
    bottom.first_field = false;
    let report = pipeline.encode_frame(&bottom, &BrcFrameInput::default()).unwrap();
    assert!(!report
        .stages
        .iter()
        .any(|s| matches!(s, StageId::Scale(_))));
}

#[test]
fn uncached_reference_skips_motion_search() {
    let mut pipeline = make_pipeline(&make_config(), RecordingSink::new());
    let i = make_ctx(0, PictureCodingType::I, 0, &[], &[]);
    let report = pipeline.encode_frame(&i, &BrcFrameInput::default()).unwrap();
    pipeline.complete_frame(&stats_for(&report)).unwrap();

    // Picture 7 was never encoded, so it has no downscaled copies.
    let p = make_ctx(1, PictureCodingType::P, 1, &[7], &[]);
    let report = pipeline.encode_frame(&p, &BrcFrameInput::default()).unwrap();
    assert!(!report.stages.iter().any(|s| matches!(s, StageId::Me(_))));
    assert_eq!(report.gaps.len(), 2);
    assert_eq!(report.stages.last(), Some(&StageId::MbEnc));
    assert_eq!(pipeline.stats().upstream_gaps, 2);
}

// ── Weighted prediction ─────────────────────────────────────────────

#[test]
fn weighted_references_bind_weighted_surfaces() {
    let mut config = make_config();
    config.features.weighted_prediction = true;
    let sink = RecordingSink::new();
    let log = sink.log();
    let mut pipeline = make_pipeline(&config, sink);

    let report = pipeline
        .encode_frame(&make_ctx(0, PictureCodingType::I, 0, &[], &[]), &BrcFrameInput::default())
        .unwrap();
    pipeline.complete_frame(&stats_for(&report)).unwrap();
    let before = log.lock().len();

    let mut p = make_ctx(1, PictureCodingType::P, 2, &[0, 1], &[]);
    p.weights = WeightedPrediction {
        weighted_pred_flag: true,
        luma_weight_l0: 0b01,
        ..WeightedPrediction::default()
    };
    let report = pipeline.encode_frame(&p, &BrcFrameInput::default()).unwrap();
    let wp_pos = report
        .stages
        .iter()
        .position(|s| *s == StageId::WeightedPred(RefList::L0, 0))
        .unwrap();
    assert_eq!(wp_pos, report.stages.len() - 2);
    assert!(!report.stages.contains(&StageId::WeightedPred(RefList::L0, 1)));

    let log = log.lock();
    let mbenc = log[before..]
        .iter()
        .find(|d| d.record.opcode == StageKind::MbEnc.opcode())
        .unwrap();
    let handles: Vec<SurfaceHandle> = mbenc.bindings.iter().map(|b| b.handle).collect();
    assert!(handles.contains(&SurfaceHandle(100)));
    assert!(!handles.contains(&make_picture(0).surfaces.raw));
    assert!(handles.contains(&make_picture(1).surfaces.raw));
}

// ── Failure handling ────────────────────────────────────────────────

#[test]
fn statistics_required_before_next_update() {
    let sink = RecordingSink::new();
    let log = sink.log();
    let mut pipeline = make_pipeline(&make_config(), sink);

    let first = pipeline
        .encode_frame(&make_ctx(0, PictureCodingType::I, 0, &[], &[]), &BrcFrameInput::default())
        .unwrap();
    let dispatched = log.lock().len();

    let p = make_ctx(1, PictureCodingType::P, 1, &[0], &[]);
    let err = pipeline.encode_frame(&p, &BrcFrameInput::default()).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidParameter { .. }));
    assert_eq!(log.lock().len(), dispatched);

    pipeline.complete_frame(&stats_for(&first)).unwrap();
    pipeline.encode_frame(&p, &BrcFrameInput::default()).unwrap();
}

#[test]
fn heap_exhaustion_aborts_frame_untouched() {
    let sink = RecordingSink::new();
    let log = sink.log();
    let mut pipeline = EncodePipeline::new(
        &make_config(),
        Box::new(sink),
        Arc::new(InMemoryKernelProvider::synthetic(4)),
        Box::new(LinearDescriptorHeap::new(50)),
    )
    .unwrap();
    let fullness = pipeline.rate_control().fullness();

    let err = pipeline
        .encode_frame(&make_ctx(0, PictureCodingType::I, 0, &[], &[]), &BrcFrameInput::default())
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::ResourceExhausted(ExhaustedResource::DescriptorHeap { .. })
    ));
    assert!(log.lock().is_empty());
    assert_eq!(pipeline.rate_control().state(), RcState::InitPending);
    assert_eq!(pipeline.rate_control().fullness(), fullness);
    assert_eq!(pipeline.heap_available(), 50);
}

#[test]
fn oversized_roi_list_rejected_before_dispatch() {
    let mut config = make_config();
    config.features.roi = true;
    let sink = RecordingSink::new();
    let log = sink.log();
    let mut pipeline = make_pipeline(&config, sink);
    let available = pipeline.heap_available();

    let rect = MbRect {
        left: 0,
        top: 0,
        right: 4,
        bottom: 4,
    };
    let mut ctx = make_ctx(0, PictureCodingType::I, 0, &[], &[]);
    ctx.roi = vec![RoiRegion { rect, qp_delta: -3 }; 6];
    let err = pipeline.encode_frame(&ctx, &BrcFrameInput::default()).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidParameter { .. }));
    assert!(log.lock().is_empty());
    assert_eq!(pipeline.heap_available(), available);
    assert_eq!(pipeline.rate_control().state(), RcState::InitPending);

    ctx.roi.truncate(4);
    let report = pipeline.encode_frame(&ctx, &BrcFrameInput::default()).unwrap();
    assert!(report.stages.contains(&StageId::BrcMbUpdate));
}

#[test]
fn sink_rejection_leaves_rate_control_uncommitted() {
    let sink = RecordingSink::new().rejecting(StageKind::MbEnc.opcode());
    let log = sink.log();
    let mut pipeline = make_pipeline(&make_config(), sink);

    let err = pipeline
        .encode_frame(&make_ctx(0, PictureCodingType::I, 0, &[], &[]), &BrcFrameInput::default())
        .unwrap_err();
    assert!(matches!(err, PipelineError::SinkRejected { .. }));
    // Everything before the macroblock encode went out.
    assert_eq!(log.lock().len(), 7);
    assert_eq!(pipeline.rate_control().state(), RcState::InitPending);
    assert_eq!(pipeline.rate_control().awaiting_statistics(), None);
    assert_eq!(pipeline.stats().frames_aborted, 1);
    assert_eq!(pipeline.stats().frames_encoded, 0);
}

#[test]
fn missing_kernel_binary_fails_construction() {
    let mut provider = InMemoryKernelProvider::synthetic(4);
    provider.remove(kp_common::kernel::KernelFamily::Hme);
    let err = EncodePipeline::new(
        &make_config(),
        Box::new(RecordingSink::new()),
        Arc::new(provider),
        Box::new(LinearDescriptorHeap::new(HEAP_SLOTS)),
    )
    .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidParameter { .. }));
}

// ── Buffer recycling ────────────────────────────────────────────────

#[test]
fn recycled_slot_waits_for_device_completion() {
    let mut config = make_config();
    config.caps.recycle_slots = 2;
    let mut pipeline = make_pipeline(&config, RecordingSink::new());

    let r0 = pipeline
        .encode_frame(&make_ctx(0, PictureCodingType::I, 0, &[], &[]), &BrcFrameInput::default())
        .unwrap();
    pipeline.complete_frame(&stats_for(&r0)).unwrap();
    let r1 = pipeline
        .encode_frame(&make_ctx(1, PictureCodingType::P, 1, &[0], &[]), &BrcFrameInput::default())
        .unwrap();
    pipeline.complete_frame(&stats_for(&r1)).unwrap();
    assert_eq!(r0.recycle_index.0, 0);
    assert_eq!(r1.recycle_index.0, 1);

    // Slot 0 is still owned by the device.
    let p2 = make_ctx(2, PictureCodingType::P, 2, &[1], &[]);
    let err = pipeline.encode_frame(&p2, &BrcFrameInput::default()).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::ResourceExhausted(ExhaustedResource::RecycleSlot { index: 0, .. })
    ));
    assert_eq!(pipeline.stats().frames_aborted, 1);

    for tag in &r0.tags {
        pipeline.mark_complete(*tag);
    }
    let r2 = pipeline.encode_frame(&p2, &BrcFrameInput::default()).unwrap();
    assert_eq!(r2.recycle_index.0, 0);
}

#[test]
fn device_thread_completions_keep_frames_flowing() {
    let mut config = make_config();
    config.caps.recycle_slots = 2;
    config.acquire_timeout_ms = 5_000;

    let (device_tx, device_rx) = channel::unbounded::<CompletionTag>();
    let sink = RecordingSink::new().with_auto_complete(device_tx);
    let mut pipeline = make_pipeline(&config, sink);

    let completions = pipeline.completion_sender();
    let device = thread::spawn(move || {
        let mut seen = 0u64;
        while let Ok(tag) = device_rx.recv() {
            seen += 1;
            // The pipeline may already be gone at shutdown.
            let _ = completions.send(tag);
        }
        seen
    });

    let mut report = pipeline
        .encode_frame(&make_ctx(0, PictureCodingType::I, 0, &[], &[]), &BrcFrameInput::default())
        .unwrap();
    for n in 1..6u32 {
        pipeline.complete_frame(&stats_for(&report)).unwrap();
        let ctx = make_ctx(u64::from(n), PictureCodingType::P, n, &[n - 1], &[]);
        report = pipeline.encode_frame(&ctx, &BrcFrameInput::default()).unwrap();
    }
    assert_eq!(pipeline.stats().frames_encoded, 6);
    assert_eq!(pipeline.stats().frames_aborted, 0);

    let dispatched = pipeline.stats().stages_dispatched;
    drop(pipeline);
    assert_eq!(device.join().unwrap(), dispatched);
}

// ── Sequence lifecycle ──────────────────────────────────────────────

#[test]
fn constant_qp_runs_without_rate_control_stages() {
    let mut config = make_config();
    config.sequence.rc_mode = RateControlMode::Cqp;
    let mut pipeline = make_pipeline(&config, RecordingSink::new());

    let report = pipeline
        .encode_frame(&make_ctx(0, PictureCodingType::I, 0, &[], &[]), &BrcFrameInput::default())
        .unwrap();
    assert_eq!(
        report.stages,
        vec![
            StageId::Scale(ScaleFactor::X4),
            StageId::Scale(ScaleFactor::X16),
            StageId::SwScoreboard,
            StageId::MbEnc,
        ]
    );
    assert!(report.brc.is_none());
    pipeline.complete_frame(&stats_for(&report)).unwrap();
    assert_eq!(pipeline.rate_control().state(), RcState::Uninitialized);
    assert_eq!(pipeline.stats().bits_produced, 250_000);
}

#[test]
fn reconfigure_dispatches_reset_kernel() {
    let sink = RecordingSink::new();
    let log = sink.log();
    let mut pipeline = make_pipeline(&make_config(), sink);
    let report = pipeline
        .encode_frame(&make_ctx(0, PictureCodingType::I, 0, &[], &[]), &BrcFrameInput::default())
        .unwrap();
    pipeline.complete_frame(&stats_for(&report)).unwrap();
    let fullness = pipeline.rate_control().fullness();

    let sequence = SequenceParams {
        target_bitrate: 4_000_000,
        ..pipeline.config().sequence.clone()
    };
    pipeline.reconfigure(&sequence).unwrap();
    assert_eq!(pipeline.rate_control().state(), RcState::ResetPending);
    assert_eq!(pipeline.rate_control().fullness(), fullness);

    let before = log.lock().len();
    let report = pipeline
        .encode_frame(&make_ctx(1, PictureCodingType::P, 1, &[0], &[]), &BrcFrameInput::default())
        .unwrap();
    assert_eq!(report.stages[0], StageId::BrcInitReset);
    let log = log.lock();
    assert_eq!(log[before].record.opcode, StageKind::BrcInitReset.opcode());
    assert_eq!(u32::from(log[before].record.variant), BrcKernel::Reset as u32);
}

#[test]
fn skipped_frames_feed_the_update() {
    let mut pipeline = make_pipeline(&make_config(), RecordingSink::new());
    let input = BrcFrameInput {
        num_skip_frames: 3,
        size_skip_frames: 12_000,
        ..BrcFrameInput::default()
    };
    let report = pipeline
        .encode_frame(&make_ctx(0, PictureCodingType::I, 0, &[], &[]), &input)
        .unwrap();
    let brc = report.brc.unwrap();
    assert_eq!(brc.num_skip_frames, 3);
    assert_eq!(brc.size_skip_frames, 12_000);
    let settings = pipeline.rate_control().settings().unwrap();
    let expected = f64::from(settings.init_fullness_bits) + settings.input_bits_per_frame * 3.0;
    assert_eq!(brc.target_size, expected as u32);
    assert!(!brc.target_size_flag);
}

#[test]
fn teardown_rejects_later_frames() {
    let mut pipeline = make_pipeline(&make_config(), RecordingSink::new());
    pipeline.teardown();
    let err = pipeline
        .encode_frame(&make_ctx(0, PictureCodingType::I, 0, &[], &[]), &BrcFrameInput::default())
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidParameter { .. }));
    assert!(pipeline.reconfigure(&SequenceParams::default()).is_err());
}

// ── Configuration ───────────────────────────────────────────────────

#[test]
fn json_config_selects_generation_layout() {
    let config = pipeline_config_from_json(
        r#"{
            "caps": { "generation": "Gen9", "recycle_slots": 3 },
            "sequence": { "rc_mode": "Vbr", "target_bitrate": 4000000, "max_bitrate": 6000000 },
            "acquire_timeout_ms": 50
        }"#,
    )
    .unwrap();
    let sink = RecordingSink::new();
    let log = sink.log();
    let mut pipeline = make_pipeline(&config, sink);

    let report = pipeline
        .encode_frame(&make_ctx(0, PictureCodingType::I, 0, &[], &[]), &BrcFrameInput::default())
        .unwrap();
    // Gen9 has no software scoreboard stage.
    assert!(!report.stages.contains(&StageId::SwScoreboard));
    assert!(!opcodes(&log).contains(&StageKind::SwScoreboard.opcode()));

    let stats = serde_json::to_value(pipeline.stats()).unwrap();
    assert_eq!(stats["frames_encoded"], 1);
}
