//! Integration test: shared sync objects, completion waits, submission and frame pacing.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use ash::vk::Handle;

use common::{group, materialized_group, FakeBackend, RecordingSink};
use mgpu_core::{DeviceBackend, DeviceGroupContext, FrameState, GroupError, GroupEvent};

#[test]
fn test_shared_fence_spans_every_gpu() {
    let (backend, mut ctx) = materialized_group(3);
    let before = backend.state().live_fences.len();

    let id = ctx.create_shared_fence().expect("shared fence");
    let fence = ctx.shared_fence(id).expect("lookup");
    assert_eq!(fence.len(), 3);
    assert!((0..3).all(|gpu| fence.handle(gpu).is_some_and(|f| !f.is_null())));
    assert!(fence.handle(3).is_none());

    let state = backend.state();
    assert_eq!(state.live_fences.len(), before + 3);
    assert!(
        (0..3).all(|gpu| state.unsignaled.contains(&fence.handle(gpu).map_or(0, |f| f.as_raw()))),
        "shared fences start unsignaled"
    );
}

#[test]
fn test_shared_semaphore_spans_every_gpu() {
    let (backend, mut ctx) = materialized_group(2);
    let first = ctx.create_shared_semaphore().expect("semaphore");
    let second = ctx.create_shared_semaphore().expect("semaphore");
    assert_ne!(first, second);

    assert_eq!(ctx.shared_semaphore(first).map(|s| s.len()), Some(2));
    assert_eq!(backend.state().live_semaphores.len(), 4);

    ctx.destroy();
    assert!(ctx.shared_semaphore(first).is_none());
    assert!(backend.state().live_semaphores.is_empty());
}

#[test]
fn test_sync_objects_need_a_materialized_group() {
    let (backend, mut ctx) = group(2);
    assert!(matches!(ctx.create_shared_fence(), Err(GroupError::Config(_))));
    assert!(matches!(ctx.create_shared_semaphore(), Err(GroupError::Config(_))));
    assert!(matches!(
        ctx.wait_for_completion(0b11, Duration::from_millis(10)),
        Err(GroupError::Config(_))
    ));
    assert!(matches!(ctx.submit_work(0, &[], 0), Err(GroupError::Config(_))));

    let state = backend.state();
    assert!(state.live_fences.is_empty());
    assert!(state.live_semaphores.is_empty());
}

#[test]
fn test_wait_on_idle_group_returns_immediately() {
    let (_backend, ctx) = materialized_group(3);
    assert_eq!(ctx.all_gpus_mask(), 0b111);

    let start = Instant::now();
    ctx.wait_for_completion(ctx.all_gpus_mask(), Duration::from_secs(5))
        .expect("idle devices are complete");
    ctx.wait_for_completion(0b010, Duration::ZERO)
        .expect("zero timeout on a signaled fence");
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_wait_rejects_bad_masks() {
    let (_backend, ctx) = materialized_group(2);
    assert!(matches!(
        ctx.wait_for_completion(0, Duration::from_secs(1)),
        Err(GroupError::Config(_))
    ));
    assert!(matches!(
        ctx.wait_for_completion(0b100, Duration::from_secs(1)),
        Err(GroupError::Config(_))
    ));
    assert!(matches!(
        ctx.wait_for_completion(u32::MAX, Duration::from_secs(1)),
        Err(GroupError::Config(_))
    ));
}

#[test]
fn test_wait_times_out_on_pending_work() {
    let (backend, mut ctx) = materialized_group(2);
    backend.state().hold_submissions = true;
    ctx.submit_work(1, &[vk::CommandBuffer::from_raw(7)], 0)
        .expect("submit");

    // GPU 0 has nothing in flight.
    ctx.wait_for_completion(0b01, Duration::ZERO).expect("GPU 0 idle");

    let start = Instant::now();
    match ctx.wait_for_completion(0b11, Duration::ZERO) {
        Err(GroupError::Timeout(t)) => assert_eq!(t, Duration::ZERO),
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert!(start.elapsed() < Duration::from_millis(500), "zero timeout returns promptly");

    let start = Instant::now();
    assert!(matches!(
        ctx.wait_for_completion(0b10, Duration::from_millis(15)),
        Err(GroupError::Timeout(_))
    ));
    assert!(start.elapsed() >= Duration::from_millis(15));
}

#[test]
fn test_submit_work_updates_stats_and_queues() {
    let backend = Arc::new(FakeBackend::with_gpus(2));
    let config = common::config_for(&backend);
    let sink = Arc::new(RecordingSink::default());
    let dyn_backend: Arc<dyn DeviceBackend> = backend.clone();
    let mut ctx =
        DeviceGroupContext::with_event_sink(config, dyn_backend, sink.clone()).expect("create");
    ctx.create_device_group().expect("group");

    let buffers = [vk::CommandBuffer::from_raw(1), vk::CommandBuffer::from_raw(2)];
    ctx.submit_work(1, &buffers, 4096).expect("submit");
    ctx.submit_work(1, &buffers[..1], 1024).expect("submit");

    assert_eq!(ctx.get_gpu_stats(1), (0.0, 5120));
    assert_eq!(ctx.get_gpu_stats(0), (0.0, 0));
    assert_eq!(ctx.snapshot().gpus[1].submissions, 2);

    let compute = ctx.compute_queue(1).map(|q| q.as_raw());
    let state = backend.state();
    assert_eq!(state.submissions.len(), 2);
    assert!(state.submissions.iter().all(|(q, _)| Some(*q) == compute));
    assert_eq!(state.submissions[0].1, 2);
    drop(state);

    assert!(sink.events().contains(&GroupEvent::WorkSubmitted {
        gpu: 1,
        command_buffers: 2,
        bytes: 4096,
    }));

    ctx.wait_for_completion(ctx.all_gpus_mask(), Duration::from_secs(1))
        .expect("submitted work completes");
}

#[test]
fn test_submit_work_rejects_bad_index() {
    let (_backend, mut ctx) = materialized_group(2);
    assert!(matches!(
        ctx.submit_work(2, &[], 0),
        Err(GroupError::Index { index: 2, count: 2 })
    ));
}

#[test]
fn test_frame_pacing_enforces_interval() {
    let (_backend, mut ctx) = group(1);
    ctx.set_frame_pacing(true, 30).expect("pacing");
    assert!(ctx.config().frame_pacing_enabled);
    assert_eq!(ctx.config().frame_interval_ms, 30);

    let start = Instant::now();
    ctx.frame_begin();
    assert_eq!(ctx.frame_state(), FrameState::InFrame);
    let frame = ctx.frame_end();
    assert_eq!(frame, 1);
    assert_eq!(ctx.frame_state(), FrameState::Idle);
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[test]
fn test_frame_pacing_disabled_does_not_sleep() {
    let (_backend, mut ctx) = group(1);
    ctx.set_frame_pacing(false, 500).expect("pacing");

    let start = Instant::now();
    for _ in 0..3 {
        ctx.frame_begin();
        ctx.frame_end();
    }
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(ctx.total_frames(), 3);

    ctx.set_frame_pacing(true, 0).expect("zero interval");
    let start = Instant::now();
    ctx.frame_begin();
    ctx.frame_end();
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_frame_begin_is_not_reentrant() {
    let backend = Arc::new(FakeBackend::with_gpus(1));
    let config = common::config_for(&backend);
    let sink = Arc::new(RecordingSink::default());
    let dyn_backend: Arc<dyn DeviceBackend> = backend;
    let mut ctx =
        DeviceGroupContext::with_event_sink(config, dyn_backend, sink.clone()).expect("create");

    ctx.frame_begin();
    ctx.frame_begin();
    assert_eq!(ctx.frame_end(), 1);
    assert_eq!(ctx.frame_state(), FrameState::Idle);

    // Unmatched end still counts, but reports no frame time.
    assert_eq!(ctx.frame_end(), 2);
    assert_eq!(ctx.total_frames(), 2);

    let completed: Vec<u64> = sink
        .events()
        .iter()
        .filter_map(|e| match e {
            GroupEvent::FrameCompleted { frame, .. } => Some(*frame),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![1]);
}

#[test]
fn test_failed_submit_leaves_gpu_idle() {
    let (backend, mut ctx) = materialized_group(2);
    ctx.wait_for_completion(0b10, Duration::ZERO).expect("idle before submit");
    let fences_before = backend.state().live_fences.len();

    backend.state().fail_submit = Some(vk::Result::ERROR_DEVICE_LOST);
    assert!(matches!(
        ctx.submit_work(1, &[], 64),
        Err(GroupError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
    ));

    ctx.wait_for_completion(0b10, Duration::from_millis(5))
        .expect("nothing in flight after a failed submit");
    assert_eq!(ctx.get_gpu_stats(1), (0.0, 0), "failed submit is not counted");
    assert_eq!(backend.state().live_fences.len(), fences_before, "old frame fence released");

    backend.state().fail_submit = None;
    ctx.submit_work(1, &[], 64).expect("submit after recovery");
    ctx.wait_for_completion(0b11, Duration::from_secs(1)).expect("complete");
    assert_eq!(ctx.get_gpu_stats(1), (0.0, 64));
}

#[test]
fn test_sync_ids_are_not_reused_after_destroy() {
    let (_backend, mut ctx) = materialized_group(2);
    let old_fence = ctx.create_shared_fence().expect("fence");
    let old_semaphore = ctx.create_shared_semaphore().expect("semaphore");

    ctx.destroy();
    ctx.create_device_group().expect("re-materialize");
    let new_fence = ctx.create_shared_fence().expect("fence");
    let new_semaphore = ctx.create_shared_semaphore().expect("semaphore");

    assert_ne!(old_fence, new_fence);
    assert_ne!(old_semaphore, new_semaphore);
    assert!(ctx.shared_fence(old_fence).is_none());
    assert!(ctx.shared_semaphore(old_semaphore).is_none());
    assert!(ctx.shared_fence(new_fence).is_some());
    assert!(ctx.shared_semaphore(new_semaphore).is_some());
}
