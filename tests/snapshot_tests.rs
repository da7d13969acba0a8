//! Snapshot Lifecycle Tests
//!
//! Tests for:
//! - SnapshotBuilder: weight culling, hidden bones, master pose remapping,
//!   previous pose capture
//! - SnapshotPool: reuse, disabled pool, low-water-mark cleanup
//! - FenceGuarded: taking back before the fence signals panics
//! - Mesh object states under both commit policies
//! - Randomized multi-instance runs: every snapshot returns to the pool

mod common;

use std::sync::Arc;

use glam::{Mat4, Vec3, Vec4};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use myth_skinning::device::{HeadlessDevice, SkinCommandList, SkinDevice};
use myth_skinning::fence::{FenceGuarded, drain_ready};
use myth_skinning::mesh::{ClothSimData, SkeletonPose};
use myth_skinning::mesh_object::MeshObjectState;
use myth_skinning::render_queue::{InstanceId, RenderCommand};
use myth_skinning::settings::{CommitPolicy, MorphSettings, SkinningSettings, SnapshotPoolSettings};
use myth_skinning::snapshot::{SnapshotBuilder, SnapshotInputs, SnapshotPool};
use myth_skinning::{InstanceUpdate, SkinnedMeshInstance, SkinningRenderer};

const EPSILON: f32 = 1e-6;

fn inputs<'a>(pose: &'a SkeletonPose, inverse_bind: &'a [Mat4], weights: &'a [f32]) -> SnapshotInputs<'a> {
    SnapshotInputs {
        pose,
        previous_pose: None,
        inverse_bind,
        morph_weights: weights,
        cloth: &[],
        cloth_blend_weight: 0.0,
        component_to_world: Mat4::IDENTITY,
        forced_lod: None,
        revision: 1,
    }
}

fn send_update(instance: &mut SkinnedMeshInstance, frame_number: u64, offset: f32) {
    instance
        .update(&InstanceUpdate {
            pose: &common::pose(offset),
            morph_weights: &[0.6, 0.4],
            cloth: &[Some(common::cloth_region())],
            cloth_blend_weight: 1.0,
            component_to_world: Mat4::IDENTITY,
            frame_number,
            teleported: false,
        })
        .unwrap();
}

fn renderer_with(policy: CommitPolicy, device: &HeadlessDevice) -> SkinningRenderer {
    let settings = SkinningSettings {
        commit_policy: policy,
        ..Default::default()
    };
    SkinningRenderer::new(settings, device.capabilities())
}

fn spawn(renderer: &SkinningRenderer, device: &HeadlessDevice) -> SkinnedMeshInstance {
    SkinnedMeshInstance::spawn(
        common::test_mesh(device),
        renderer.command_sender(),
        renderer.snapshot_pool(),
        MorphSettings::default(),
    )
    .unwrap()
}

// ============================================================================
// SnapshotBuilder Tests
// ============================================================================

#[test]
fn weights_outside_blend_range_are_culled() {
    let pool = SnapshotPool::default();
    let pose = common::pose(0.0);
    let inverse_bind = vec![Mat4::IDENTITY; 3];
    let weights = [0.5, 0.0, 1e-9, 6.0, -2.0];

    let snapshot = SnapshotBuilder::new(&pool, &MorphSettings::default())
        .build(&inputs(&pose, &inverse_bind, &weights));

    let active: Vec<(u32, f32)> = snapshot.active_morphs().iter().map(|m| (m.index, m.weight)).collect();
    assert_eq!(active, vec![(0, 0.5), (4, -2.0)]);
    assert_eq!(snapshot.num_weighted_active_morphs(), 2);
}

#[test]
fn ref_to_local_combines_pose_and_inverse_bind() {
    let pool = SnapshotPool::default();
    let pose = common::pose(2.0);
    let inverse_bind = vec![Mat4::from_translation(Vec3::new(-1.0, 0.0, 0.0)); 3];

    let snapshot = SnapshotBuilder::new(&pool, &MorphSettings::default())
        .build(&inputs(&pose, &inverse_bind, &[]));

    assert_eq!(snapshot.ref_to_local().len(), 3);
    let moved = snapshot.ref_to_local()[2].transform_point3(Vec3::ZERO);
    assert!((moved - Vec3::new(1.0, 2.0, 0.0)).length() < EPSILON);
    assert!(snapshot.previous_ref_to_local().is_none());
}

#[test]
fn hidden_bone_collapses_to_its_position() {
    let pool = SnapshotPool::default();
    let mut pose = common::pose(3.0);
    pose.visible[1] = false;
    let inverse_bind = vec![Mat4::IDENTITY; 3];

    let snapshot = SnapshotBuilder::new(&pool, &MorphSettings::default())
        .build(&inputs(&pose, &inverse_bind, &[]));

    let hidden = snapshot.ref_to_local()[1];
    assert_eq!(hidden.x_axis, Vec4::ZERO);
    assert_eq!(hidden.y_axis, Vec4::ZERO);
    assert_eq!(hidden.z_axis, Vec4::ZERO);
    assert_eq!(hidden.w_axis, Vec4::new(3.0, 1.0, 0.0, 1.0));
    assert_ne!(snapshot.ref_to_local()[0].x_axis, Vec4::ZERO);
}

#[test]
fn master_pose_remap_follows_mapping() {
    let pool = SnapshotPool::default();
    let mut pose = common::pose(0.0);
    pose.master_remap = Some(vec![Some(2), None, Some(0)]);
    let inverse_bind = vec![Mat4::IDENTITY; 3];

    let snapshot = SnapshotBuilder::new(&pool, &MorphSettings::default())
        .build(&inputs(&pose, &inverse_bind, &[]));

    assert_eq!(snapshot.ref_to_local()[0], pose.component_space[2]);
    assert_eq!(snapshot.ref_to_local()[1], Mat4::IDENTITY);
    assert_eq!(snapshot.ref_to_local()[2], pose.component_space[0]);
}

#[test]
fn previous_pose_is_captured_when_given() {
    let pool = SnapshotPool::default();
    let pose = common::pose(1.0);
    let previous = common::pose(0.0);
    let inverse_bind = vec![Mat4::IDENTITY; 3];

    let snapshot = SnapshotBuilder::new(&pool, &MorphSettings::default()).build(&SnapshotInputs {
        previous_pose: Some(&previous),
        ..inputs(&pose, &inverse_bind, &[])
    });

    let previous_matrices = snapshot.previous_ref_to_local().unwrap();
    assert_eq!(previous_matrices[0], previous.component_space[0]);
    assert_ne!(previous_matrices[0], snapshot.ref_to_local()[0]);
}

#[test]
fn snapshot_keeps_cloth_and_transform() {
    let pool = SnapshotPool::default();
    let pose = common::pose(0.0);
    let inverse_bind = vec![Mat4::IDENTITY; 3];
    let cloth = [None, Some(ClothSimData::default())];
    let transform = Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0));

    let snapshot = SnapshotBuilder::new(&pool, &MorphSettings::default()).build(&SnapshotInputs {
        cloth: &cloth,
        cloth_blend_weight: 0.75,
        component_to_world: transform,
        forced_lod: Some(1),
        revision: 9,
        ..inputs(&pose, &inverse_bind, &[])
    });

    assert!(snapshot.has_cloth());
    assert!(snapshot.cloth(0).is_none());
    assert!(snapshot.cloth(1).is_some());
    assert!(snapshot.cloth(5).is_none());
    assert_eq!(snapshot.cloth_blend_weight(), 0.75);
    assert_eq!(snapshot.component_to_world(), transform);
    assert_eq!(snapshot.forced_lod(), Some(1));
    assert_eq!(snapshot.revision(), 9);
}

#[test]
fn active_morph_comparison_uses_threshold() {
    let pool = SnapshotPool::default();
    let pose = common::pose(0.0);
    let inverse_bind = vec![Mat4::IDENTITY; 3];
    let builder = SnapshotBuilder::new(&pool, &MorphSettings::default());

    let a = builder.build(&inputs(&pose, &inverse_bind, &[0.5, 0.25]));
    let b = builder.build(&inputs(&pose, &inverse_bind, &[0.5, 0.2501]));
    let c = builder.build(&inputs(&pose, &inverse_bind, &[0.5]));

    assert!(a.active_morphs_equal(&b, 0.001));
    assert!(!a.active_morphs_equal(&b, 1e-6));
    assert!(!a.active_morphs_equal(&c, 0.001));
}

#[test]
fn morph_sections_come_from_active_morphs() {
    let device = HeadlessDevice::immediate();
    let mesh = common::test_mesh(&device);
    let pool = SnapshotPool::default();
    let pose = common::pose(0.0);
    let builder = SnapshotBuilder::new(&pool, &MorphSettings::default());

    let with_morphs = builder.build(&inputs(&pose, &mesh.inverse_bind_matrices, &[0.0, 0.7]));
    assert_eq!(with_morphs.morph_sections(&mesh.lods[0].morph_targets), vec![1]);

    let without = builder.build(&inputs(&pose, &mesh.inverse_bind_matrices, &[0.0, 0.0]));
    assert!(without.morph_sections(&mesh.lods[0].morph_targets).is_empty());
}

// ============================================================================
// SnapshotPool Tests
// ============================================================================

#[test]
fn freed_storage_is_reused() {
    let pool = SnapshotPool::default();
    let pose = common::pose(0.0);
    let inverse_bind = vec![Mat4::IDENTITY; 3];
    let builder = SnapshotBuilder::new(&pool, &MorphSettings::default());

    let first = builder.build(&inputs(&pose, &inverse_bind, &[1.0]));
    pool.free(first);
    assert_eq!(pool.free_count(), 1);

    let second = builder.build(&inputs(&pose, &inverse_bind, &[]));
    assert_eq!(pool.created_count(), 1);
    assert_eq!(pool.free_count(), 0);
    // Reset on free: nothing of the first snapshot leaks through.
    assert!(second.active_morphs().is_empty());
}

#[test]
fn disabled_pool_never_recycles() {
    let pool = SnapshotPool::new(SnapshotPoolSettings {
        enabled: false,
        cleanup_interval: 4,
    });
    let pose = common::pose(0.0);
    let inverse_bind = vec![Mat4::IDENTITY; 3];
    let builder = SnapshotBuilder::new(&pool, &MorphSettings::default());

    for _ in 0..3 {
        let snapshot = builder.build(&inputs(&pose, &inverse_bind, &[]));
        pool.free(snapshot);
    }
    assert!(!pool.is_enabled());
    assert_eq!(pool.free_count(), 0);
    assert_eq!(pool.created_count(), 3);
}

#[test]
fn storage_idle_for_a_whole_interval_is_dropped() {
    let pool = SnapshotPool::new(SnapshotPoolSettings {
        enabled: true,
        cleanup_interval: 4,
    });
    let pose = common::pose(0.0);
    let inverse_bind = vec![Mat4::IDENTITY; 3];
    let builder = SnapshotBuilder::new(&pool, &MorphSettings::default());
    let build = || builder.build(&inputs(&pose, &inverse_bind, &[]));

    // Spike: three storages at once.
    let spike: Vec<_> = (0..3).map(|_| build()).collect();
    for snapshot in spike {
        pool.free(snapshot);
    }
    assert_eq!(pool.created_count(), 3);
    assert_eq!(pool.free_count(), 3);

    // Fourth allocation ends the first interval; nothing was idle yet.
    let s = build();
    pool.free(s);
    assert_eq!(pool.free_count(), 3);

    // Steady state uses one storage; two sit idle for the whole interval.
    for _ in 0..3 {
        let s = build();
        pool.free(s);
    }
    let s = build();
    assert_eq!(pool.free_count(), 0);
    pool.free(s);

    assert_eq!(pool.free_count(), 1);
    assert_eq!(pool.created_count(), 3);
}

// ============================================================================
// FenceGuarded Tests
// ============================================================================

#[test]
#[should_panic(expected = "StaleFenceWait")]
fn taking_before_fence_signals_panics() {
    let device = HeadlessDevice::manual();
    let fence = device.submit(SkinCommandList::new()).unwrap();
    let guarded = FenceGuarded::new(7u32, fence);
    let _ = guarded.take(&device);
}

#[test]
fn guarded_value_returns_after_signal() {
    let device = HeadlessDevice::manual();
    let fence = device.submit(SkinCommandList::new()).unwrap();

    let guarded = FenceGuarded::new(7u32, fence);
    assert!(!guarded.is_ready(&device));
    let guarded = guarded.try_take(&device).unwrap_err();
    assert_eq!(*guarded.get(), 7);

    device.signal_through(fence);
    assert_eq!(guarded.take(&device), 7);
}

#[test]
fn wait_blocks_until_signaled() {
    let device = HeadlessDevice::manual();
    let fence = device.submit(SkinCommandList::new()).unwrap();
    assert_eq!(FenceGuarded::new("bones", fence).wait(&device), "bones");
    assert_eq!(device.pending_fence_count(), 0);
}

#[test]
fn drain_ready_keeps_pending_entries_in_order() {
    let device = HeadlessDevice::manual();
    let f1 = device.submit(SkinCommandList::new()).unwrap();
    let f2 = device.submit(SkinCommandList::new()).unwrap();
    let f3 = device.submit(SkinCommandList::new()).unwrap();
    let mut guarded = vec![
        FenceGuarded::new(1, f1),
        FenceGuarded::new(2, f2),
        FenceGuarded::new(3, f3),
    ];

    device.signal_through(f2);
    assert_eq!(drain_ready(&mut guarded, &device), vec![1, 2]);
    assert_eq!(guarded.len(), 1);
    assert_eq!(guarded[0].fence(), f3);
}

// ============================================================================
// Mesh Object State Tests
// ============================================================================

#[test]
fn immediate_commit_tracks_fenced_previous_snapshot() {
    let device = HeadlessDevice::manual();
    let mut renderer = renderer_with(CommitPolicy::Immediate, &device);
    let mut instance = spawn(&renderer, &device);
    let id = instance.id();

    send_update(&mut instance, 1, 0.0);
    let mut ctx = renderer.begin_frame(&device);
    renderer.process_commands(&mut ctx).unwrap();
    // Committed: the GPU reads the live snapshot until this frame's fence.
    assert_eq!(renderer.object(id).unwrap().state(&device), MeshObjectState::AwaitingFence);
    assert!(!renderer.object(id).unwrap().has_previous_snapshot());
    renderer.transition_all_to_readable(&mut ctx);
    renderer.end_frame(ctx).unwrap();

    send_update(&mut instance, 2, 1.0);
    let mut ctx = renderer.begin_frame(&device);
    renderer.process_commands(&mut ctx).unwrap();
    let object = renderer.object(id).unwrap();
    assert_eq!(object.state(&device), MeshObjectState::AwaitingFence);
    assert!(object.has_previous_snapshot());
    assert_eq!(object.last_revision(), Some(2));
    renderer.transition_all_to_readable(&mut ctx);
    renderer.end_frame(ctx).unwrap();

    device.signal_all();
    let ctx = renderer.begin_frame(&device);
    assert_eq!(renderer.object(id).unwrap().state(&device), MeshObjectState::Idle);
    renderer.end_frame(ctx).unwrap();

    instance.release().unwrap();
    renderer.shutdown(&device).unwrap();
}

#[test]
fn deferred_commit_waits_for_pre_frame() {
    let device = HeadlessDevice::manual();
    let mut renderer = renderer_with(CommitPolicy::DeferUntilPreFrame, &device);
    let mut instance = spawn(&renderer, &device);
    let id = instance.id();

    send_update(&mut instance, 1, 0.0);
    let mut ctx = renderer.begin_frame(&device);
    renderer.process_commands(&mut ctx).unwrap();
    assert_eq!(renderer.object(id).unwrap().state(&device), MeshObjectState::SnapshotQueued);
    assert_eq!(renderer.deferred_count(), 1);
    assert_eq!(renderer.object(id).unwrap().last_revision(), None);

    assert_eq!(renderer.pre_frame_commit(&mut ctx).unwrap(), 1);
    assert_eq!(renderer.object(id).unwrap().state(&device), MeshObjectState::AwaitingFence);
    assert_eq!(renderer.object(id).unwrap().last_frame_prepared(), Some(1));
    renderer.transition_all_to_readable(&mut ctx);
    renderer.end_frame(ctx).unwrap();

    device.signal_all();
    assert_eq!(renderer.object(id).unwrap().state(&device), MeshObjectState::Idle);

    instance.release().unwrap();
    renderer.shutdown(&device).unwrap();
}

#[test]
fn snapshot_replaced_before_commit_is_freed_at_once() {
    let device = HeadlessDevice::manual();
    let mut renderer = renderer_with(CommitPolicy::DeferUntilPreFrame, &device);
    let pool = renderer.snapshot_pool();
    let mut instance = spawn(&renderer, &device);
    let id = instance.id();

    send_update(&mut instance, 1, 0.0);
    send_update(&mut instance, 1, 0.5);
    let mut ctx = renderer.begin_frame(&device);
    renderer.process_commands(&mut ctx).unwrap();
    assert_eq!(pool.created_count(), 2);
    assert_eq!(pool.free_count(), 1);

    assert_eq!(renderer.pre_frame_commit(&mut ctx).unwrap(), 1);
    assert_eq!(renderer.object(id).unwrap().last_revision(), Some(2));
    renderer.transition_all_to_readable(&mut ctx);
    renderer.end_frame(ctx).unwrap();

    instance.release().unwrap();
    renderer.shutdown(&device).unwrap();
}

#[test]
fn unsignaled_previous_snapshot_is_retired_to_resources() {
    let device = HeadlessDevice::manual();
    let mut renderer = renderer_with(CommitPolicy::Immediate, &device);
    let mut instance = spawn(&renderer, &device);

    for frame in 1..=3 {
        send_update(&mut instance, frame, frame as f32);
        let mut ctx = renderer.begin_frame(&device);
        renderer.process_commands(&mut ctx).unwrap();
        renderer.transition_all_to_readable(&mut ctx);
        renderer.end_frame(ctx).unwrap();
    }
    // Frame 1's snapshot was displaced from `previous` while fence 1 was pending.
    assert_eq!(renderer.resources().retired_snapshot_count(), 1);

    device.signal_all();
    let ctx = renderer.begin_frame(&device);
    assert_eq!(renderer.resources().retired_snapshot_count(), 0);
    renderer.end_frame(ctx).unwrap();

    instance.release().unwrap();
    renderer.shutdown(&device).unwrap();
}

#[test]
fn update_for_unknown_object_frees_its_snapshot() {
    let device = HeadlessDevice::immediate();
    let mut renderer = renderer_with(CommitPolicy::Immediate, &device);
    let pool = renderer.snapshot_pool();
    let pose = common::pose(0.0);
    let inverse_bind = vec![Mat4::IDENTITY; 3];

    let snapshot = SnapshotBuilder::new(&pool, &MorphSettings::default())
        .build(&inputs(&pose, &inverse_bind, &[]));
    renderer
        .command_sender()
        .send(RenderCommand::UpdateDynamicData {
            id: InstanceId::next(),
            snapshot,
            frame_to_prepare: 1,
            revision: 1,
        })
        .unwrap();

    let mut ctx = renderer.begin_frame(&device);
    assert_eq!(renderer.process_commands(&mut ctx).unwrap(), 1);
    renderer.end_frame(ctx).unwrap();

    assert_eq!(renderer.object_count(), 0);
    assert_eq!(pool.free_count(), 1);
}

// ============================================================================
// Randomized Lifecycle Tests
// ============================================================================

#[test]
fn random_instance_churn_returns_every_snapshot() {
    let mut rng = StdRng::seed_from_u64(7);
    let device = HeadlessDevice::manual();
    let settings = SkinningSettings {
        snapshot_pool: SnapshotPoolSettings {
            enabled: true,
            cleanup_interval: 1_000_000,
        },
        commit_policy: CommitPolicy::DeferUntilPreFrame,
        ..Default::default()
    };
    let mut renderer = SkinningRenderer::new(settings, device.capabilities());
    let mesh = common::test_mesh_with_lods(&device, 2);
    let pool = renderer.snapshot_pool();

    let spawn_instance = |renderer: &SkinningRenderer| {
        SkinnedMeshInstance::spawn(
            Arc::clone(&mesh),
            renderer.command_sender(),
            renderer.snapshot_pool(),
            MorphSettings::default(),
        )
        .unwrap()
    };
    let mut instances: Vec<SkinnedMeshInstance> = (0..3).map(|_| spawn_instance(&renderer)).collect();

    for _ in 0..200 {
        let frame_number = renderer.frame_number() + 1;

        if rng.gen_bool(0.05) && !instances.is_empty() {
            instances.shuffle(&mut rng);
            if let Some(instance) = instances.pop() {
                instance.release().unwrap();
            }
        }
        if rng.gen_bool(0.05) && instances.len() < 5 {
            instances.push(spawn_instance(&renderer));
        }

        for instance in &mut instances {
            if rng.gen_bool(0.1) {
                let lod = if rng.gen_bool(0.5) { Some(rng.gen_range(0..2)) } else { None };
                instance.set_forced_lod(lod);
            }
            if !rng.gen_bool(0.8) {
                continue;
            }
            let weights: [f32; 2] = [
                if rng.gen_bool(0.5) { rng.gen_range(0.0..1.0) } else { 0.0 },
                if rng.gen_bool(0.5) { rng.gen_range(0.0..1.0) } else { 0.0 },
            ];
            let cloth = if rng.gen_bool(0.5) {
                vec![Some(common::cloth_region())]
            } else {
                vec![None]
            };
            instance
                .update(&InstanceUpdate {
                    pose: &common::pose(rng.gen_range(-1.0..1.0)),
                    morph_weights: &weights,
                    cloth: &cloth,
                    cloth_blend_weight: 1.0,
                    component_to_world: Mat4::IDENTITY,
                    frame_number,
                    teleported: rng.gen_bool(0.05),
                })
                .unwrap();
        }

        let mut ctx = renderer.begin_frame(&device);
        renderer.process_commands(&mut ctx).unwrap();
        renderer.pre_frame_commit(&mut ctx).unwrap();
        renderer.transition_all_to_readable(&mut ctx);
        for instance in &instances {
            for section in 0..3 {
                let _ = renderer.vertex_source(instance.id(), section);
            }
        }
        renderer.end_frame(ctx).unwrap();

        if rng.gen_bool(0.5) {
            device.signal_next();
        }
        if rng.gen_bool(0.1) || device.pending_fence_count() > 6 {
            device.signal_next();
        }
    }

    for instance in instances.drain(..) {
        instance.release().unwrap();
    }
    let mut ctx = renderer.begin_frame(&device);
    renderer.process_commands(&mut ctx).unwrap();
    renderer.end_frame(ctx).unwrap();
    assert_eq!(renderer.object_count(), 0);

    renderer.shutdown(&device).unwrap();

    assert_eq!(pool.free_count() as u64, pool.created_count());
    assert_eq!(renderer.resources().retired_snapshot_count(), 0);
    assert_eq!(renderer.resources().bone_pool.allocated_bytes(), 0);
    assert_eq!(renderer.resources().cloth_pool.allocated_bytes(), 0);
    assert_eq!(renderer.skin_cache().pool_stats().allocated_bytes, 0);
    assert_eq!(device.live_buffer_count(), common::static_buffer_count(2));
}
