//! End-to-End Pipeline Tests
//!
//! Tests for:
//! - Simulation instance → render command → mesh object → skin cache
//! - Skin cache budget across sections and instances, tangent scratch included
//! - A failing render command does not drop the rest of the queue
//! - Dispatches recorded per frame (skinning permutations, morph passes)
//! - CPU morph blending when compute shaders are unavailable
//! - LOD selection from views and forced LODs
//! - Shutdown leaves only caller-owned buffers alive

mod common;

use glam::{Mat4, Vec3};

use myth_skinning::device::{
    DeviceCapabilities, FenceId, FenceMode, HeadlessDevice, SkinDevice, SkinKernel, SkinPermutation,
};
use myth_skinning::lod::{BoundingSphere, LodView};
use myth_skinning::morph::{ActiveMorphTarget, blend_morphs_cpu};
use myth_skinning::render_queue::InstanceId;
use myth_skinning::settings::{
    CommitPolicy, MorphSettings, RecomputeTangents, SkinCacheSettings, SkinningSettings,
};
use myth_skinning::vertex_factory::{BoneMatrix3x4, FactoryKind, VertexSource};
use myth_skinning::{InstanceUpdate, SkinError, SkinnedMeshInstance, SkinningRenderer};

fn renderer(settings: SkinningSettings, device: &HeadlessDevice) -> SkinningRenderer {
    common::init_logging();
    SkinningRenderer::new(settings, device.capabilities())
}

fn budget_settings(budget_bytes: u64) -> SkinningSettings {
    SkinningSettings {
        skin_cache: SkinCacheSettings {
            budget_bytes,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn spawn(renderer: &SkinningRenderer, device: &HeadlessDevice, num_lods: usize) -> SkinnedMeshInstance {
    SkinnedMeshInstance::spawn(
        common::test_mesh_with_lods(device, num_lods),
        renderer.command_sender(),
        renderer.snapshot_pool(),
        MorphSettings::default(),
    )
    .unwrap()
}

fn update(instance: &mut SkinnedMeshInstance, renderer: &SkinningRenderer, offset: f32) {
    instance
        .update(&InstanceUpdate {
            pose: &common::pose(offset),
            morph_weights: &[0.6, 0.4],
            cloth: &[Some(common::cloth_region())],
            cloth_blend_weight: 1.0,
            component_to_world: Mat4::IDENTITY,
            frame_number: renderer.frame_number() + 1,
            teleported: false,
        })
        .unwrap();
}

/// One full render-thread frame.
fn run_frame(renderer: &mut SkinningRenderer, device: &HeadlessDevice) -> anyhow::Result<FenceId> {
    let mut ctx = renderer.begin_frame(device);
    renderer.process_commands(&mut ctx)?;
    renderer.pre_frame_commit(&mut ctx)?;
    renderer.transition_all_to_readable(&mut ctx);
    Ok(renderer.end_frame(ctx)?)
}

fn last_dispatches(device: &HeadlessDevice, kernel: SkinKernel) -> usize {
    device
        .with_last_submission(|commands| commands.dispatch_count(kernel))
        .unwrap()
}

fn skin(permutation: SkinPermutation) -> SkinKernel {
    SkinKernel::SkinVertices(permutation)
}

// ============================================================================
// Skin Cache Budget Tests
// ============================================================================

#[test]
fn budget_admits_sections_in_order_and_reports_the_rest() -> anyhow::Result<()> {
    let device = HeadlessDevice::immediate();
    let mut renderer = renderer(budget_settings(2 * common::ENTRY_FOOTPRINT), &device);
    let mut instance = spawn(&renderer, &device, 1);

    update(&mut instance, &renderer, 0.0);
    run_frame(&mut renderer, &device)?;

    let object = renderer.object(instance.id()).unwrap();
    assert!(object.cache_entry(0).is_some());
    assert!(object.cache_entry(1).is_some());
    assert!(object.cache_entry(2).is_none());
    assert_eq!(renderer.skin_cache().used_bytes(), 2 * common::ENTRY_FOOTPRINT);
    assert_eq!(renderer.extra_required_memory(), common::ENTRY_FOOTPRINT);

    assert!(renderer.vertex_source(instance.id(), 0).unwrap().is_passthrough());
    assert!(renderer.vertex_source(instance.id(), 1).unwrap().is_passthrough());
    match renderer.vertex_source(instance.id(), 2).unwrap() {
        VertexSource::Original { kind, cloth, bones, .. } => {
            assert_eq!(kind, FactoryKind::Cloth);
            assert!(cloth.is_some());
            assert!(bones.is_some());
        }
        other => panic!("expected uncached source, got {other:?}"),
    }
    Ok(())
}

#[test]
fn budget_is_shared_between_instances() -> anyhow::Result<()> {
    let device = HeadlessDevice::immediate();
    let mut renderer = renderer(budget_settings(2 * common::ENTRY_FOOTPRINT), &device);
    let mut first = spawn(&renderer, &device, 1);
    let mut second = spawn(&renderer, &device, 1);

    update(&mut first, &renderer, 0.0);
    update(&mut second, &renderer, 0.0);
    run_frame(&mut renderer, &device)?;

    let second_object = renderer.object(second.id()).unwrap();
    assert!((0..3).all(|s| second_object.cache_entry(s).is_none()));
    assert_eq!(renderer.extra_required_memory(), 4 * common::ENTRY_FOOTPRINT);

    // Releasing the first instance frees its budget within the same frame.
    let second_id = second.id();
    first.release()?;
    update(&mut second, &renderer, 1.0);
    run_frame(&mut renderer, &device)?;

    let second_object = renderer.object(second_id).unwrap();
    assert!(second_object.cache_entry(0).is_some());
    assert!(second_object.cache_entry(1).is_some());
    assert!(second_object.cache_entry(2).is_none());
    assert_eq!(renderer.object_count(), 1);
    Ok(())
}

#[test]
fn sections_without_room_for_tangent_scratch_stay_uncached() -> anyhow::Result<()> {
    let device = HeadlessDevice::immediate();
    let settings = SkinningSettings {
        skin_cache: SkinCacheSettings {
            budget_bytes: common::ENTRY_FOOTPRINT,
            recompute_tangents: RecomputeTangents::All,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut renderer = renderer(settings, &device);
    let mut instance = spawn(&renderer, &device, 1);

    update(&mut instance, &renderer, 0.0);
    run_frame(&mut renderer, &device)?;

    let object = renderer.object(instance.id()).unwrap();
    assert!((0..3).all(|s| object.cache_entry(s).is_none()));
    assert_eq!(renderer.skin_cache().used_bytes(), 0);
    // Each section needs its outputs plus one 4 KiB scratch bucket.
    assert_eq!(renderer.extra_required_memory(), 3 * (common::ENTRY_FOOTPRINT + 4096));
    assert!((0..3).all(|s| !renderer.vertex_source(instance.id(), s).unwrap().is_passthrough()));
    assert_eq!(last_dispatches(&device, SkinKernel::RecomputeTangentsPerTriangle), 0);
    Ok(())
}

#[test]
fn extra_required_memory_resets_every_frame() -> anyhow::Result<()> {
    let device = HeadlessDevice::immediate();
    let mut renderer = renderer(budget_settings(2 * common::ENTRY_FOOTPRINT), &device);
    let mut instance = spawn(&renderer, &device, 1);

    update(&mut instance, &renderer, 0.0);
    run_frame(&mut renderer, &device)?;
    assert_eq!(renderer.extra_required_memory(), common::ENTRY_FOOTPRINT);

    // No new snapshot, nothing is processed.
    run_frame(&mut renderer, &device)?;
    assert_eq!(renderer.extra_required_memory(), 0);
    Ok(())
}

// ============================================================================
// Dispatch Tests
// ============================================================================

#[test]
fn first_frame_records_one_dispatch_per_section_and_morph_pass() -> anyhow::Result<()> {
    let device = HeadlessDevice::immediate();
    let mut renderer = renderer(SkinningSettings::default(), &device);
    let mut instance = spawn(&renderer, &device, 1);

    update(&mut instance, &renderer, 0.0);
    run_frame(&mut renderer, &device)?;

    assert_eq!(last_dispatches(&device, skin(SkinPermutation::empty())), 1);
    assert_eq!(last_dispatches(&device, skin(SkinPermutation::MORPH)), 1);
    assert_eq!(last_dispatches(&device, skin(SkinPermutation::CLOTH)), 1);
    assert_eq!(last_dispatches(&device, skin(SkinPermutation::MORPH | SkinPermutation::CLOTH)), 0);
    assert_eq!(last_dispatches(&device, SkinKernel::MorphUpdate), 1);
    assert_eq!(last_dispatches(&device, SkinKernel::MorphNormalize), 1);
    assert_eq!(last_dispatches(&device, SkinKernel::RecomputeTangentsPerTriangle), 0);

    // Single revision so far: previous positions alias current ones.
    let Some(VertexSource::Passthrough { buffers, .. }) = renderer.vertex_source(instance.id(), 0) else {
        panic!("section 0 should be cached");
    };
    assert_eq!(buffers.positions, buffers.previous_positions);
    Ok(())
}

#[test]
fn unchanged_morph_weights_skip_morph_passes() -> anyhow::Result<()> {
    let device = HeadlessDevice::immediate();
    let mut renderer = renderer(SkinningSettings::default(), &device);
    let mut instance = spawn(&renderer, &device, 1);

    update(&mut instance, &renderer, 0.0);
    run_frame(&mut renderer, &device)?;
    update(&mut instance, &renderer, 1.0);
    run_frame(&mut renderer, &device)?;

    let skinned: usize = [
        SkinPermutation::empty(),
        SkinPermutation::MORPH,
        SkinPermutation::CLOTH,
    ]
    .into_iter()
    .map(|p| last_dispatches(&device, skin(p)))
    .sum();
    assert_eq!(skinned, 3);
    assert_eq!(last_dispatches(&device, SkinKernel::MorphUpdate), 0);
    assert_eq!(last_dispatches(&device, SkinKernel::MorphNormalize), 0);

    // Two revisions: current and previous positions are distinct buffers.
    let Some(VertexSource::Passthrough { buffers, .. }) = renderer.vertex_source(instance.id(), 0) else {
        panic!("section 0 should be cached");
    };
    assert_ne!(buffers.positions, buffers.previous_positions);
    assert_eq!(renderer.object(instance.id()).unwrap().last_revision(), Some(2));
    Ok(())
}

#[test]
fn frame_without_snapshot_records_no_dispatches() -> anyhow::Result<()> {
    let device = HeadlessDevice::immediate();
    let mut renderer = renderer(SkinningSettings::default(), &device);
    let mut instance = spawn(&renderer, &device, 1);

    update(&mut instance, &renderer, 0.0);
    run_frame(&mut renderer, &device)?;
    run_frame(&mut renderer, &device)?;

    assert_eq!(last_dispatches(&device, skin(SkinPermutation::empty())), 0);
    // Outputs of the last commit remain drawable.
    assert!(renderer.vertex_source(instance.id(), 0).unwrap().is_passthrough());
    Ok(())
}

#[test]
fn bone_matrices_are_uploaded_per_section() -> anyhow::Result<()> {
    let device = HeadlessDevice::immediate();
    let mut renderer = renderer(budget_settings(0), &device);
    let mut instance = spawn(&renderer, &device, 1);

    update(&mut instance, &renderer, 3.0);
    run_frame(&mut renderer, &device)?;

    // Section 2 maps bones [0, 2].
    let Some(VertexSource::Original { bones: Some(bones), .. }) = renderer.vertex_source(instance.id(), 2) else {
        panic!("section 2 should be uncached with bones");
    };
    let bytes = device.buffer_contents(bones).unwrap();
    let first: BoneMatrix3x4 = bytemuck::pod_read_unaligned(&bytes[0..48]);
    let second: BoneMatrix3x4 = bytemuck::pod_read_unaligned(&bytes[48..96]);
    assert_eq!(first.rows[0], [1.0, 0.0, 0.0, 3.0]);
    assert_eq!(first.rows[1], [0.0, 1.0, 0.0, 0.0]);
    assert_eq!(second.rows[1], [0.0, 1.0, 0.0, 2.0]);
    Ok(())
}

// ============================================================================
// CPU Morph Tests
// ============================================================================

#[test]
fn cpu_morph_blending_without_compute_shaders() -> anyhow::Result<()> {
    let caps = DeviceCapabilities {
        compute_shaders: false,
        ..Default::default()
    };
    let device = HeadlessDevice::new(caps, FenceMode::Immediate);
    let mut renderer = renderer(SkinningSettings::default(), &device);
    let mut instance = spawn(&renderer, &device, 1);

    update(&mut instance, &renderer, 0.0);
    run_frame(&mut renderer, &device)?;

    assert!(renderer.skin_cache().is_inert());
    assert_eq!(last_dispatches(&device, SkinKernel::MorphUpdate), 0);

    let Some(VertexSource::Original {
        kind,
        morph: Some(morph),
        ..
    }) = renderer.vertex_source(instance.id(), 1)
    else {
        panic!("section 1 should read the morph vertex buffer");
    };
    assert_eq!(kind, FactoryKind::Morph);

    let mesh = instance.mesh();
    let active = [
        ActiveMorphTarget { index: 0, weight: 0.6 },
        ActiveMorphTarget { index: 1, weight: 0.4 },
    ];
    let expected = blend_morphs_cpu(&mesh.lods[0].morph_targets, &active, mesh.lods[0].num_vertices);
    let contents = device.buffer_contents(morph).unwrap();
    assert_eq!(contents.as_slice(), bytemuck::cast_slice::<_, u8>(expected.as_slice()));

    // Section 0 has no morph deltas, so it never binds the buffer.
    let Some(VertexSource::Original { kind, morph, .. }) = renderer.vertex_source(instance.id(), 0) else {
        panic!("section 0 should be uncached");
    };
    assert_eq!(kind, FactoryKind::Base);
    assert!(morph.is_none());
    Ok(())
}

// ============================================================================
// LOD Tests
// ============================================================================

fn view() -> LodView {
    LodView {
        origin: Vec3::ZERO,
        projection: Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 1000.0),
    }
}

fn bounds_at(distance: f32) -> BoundingSphere {
    BoundingSphere {
        center: Vec3::new(0.0, 0.0, -distance),
        radius: 1.0,
    }
}

#[test]
fn forced_lod_overrides_selection() -> anyhow::Result<()> {
    let device = HeadlessDevice::immediate();
    let mut renderer = renderer(SkinningSettings::default(), &device);
    let mut instance = spawn(&renderer, &device, 2);

    instance.set_forced_lod(Some(1));
    update(&mut instance, &renderer, 0.0);
    run_frame(&mut renderer, &device)?;

    let object = renderer.object(instance.id()).unwrap();
    assert_eq!(object.processed_lod(), Some(1));
    assert!(object.cache_entry(0).is_some());
    assert!(renderer.vertex_source(instance.id(), 0).unwrap().is_passthrough());
    assert!(renderer.vertex_source(instance.id(), 1).is_none());
    assert_eq!(renderer.skin_cache().entry_count(), 1);

    // Back to screen-size selection: LOD 0 replaces the coarse entry.
    instance.set_forced_lod(None);
    update(&mut instance, &renderer, 0.0);
    run_frame(&mut renderer, &device)?;

    let object = renderer.object(instance.id()).unwrap();
    assert_eq!(object.processed_lod(), Some(0));
    assert_eq!(renderer.skin_cache().entry_count(), 3);
    Ok(())
}

#[test]
fn forced_lod_past_the_last_is_clamped() -> anyhow::Result<()> {
    let device = HeadlessDevice::immediate();
    let mut renderer = renderer(SkinningSettings::default(), &device);
    let mut instance = spawn(&renderer, &device, 2);

    instance.set_forced_lod(Some(7));
    update(&mut instance, &renderer, 0.0);
    run_frame(&mut renderer, &device)?;

    assert_eq!(renderer.object(instance.id()).unwrap().processed_lod(), Some(1));
    Ok(())
}

#[test]
fn view_driven_lod_applies_from_the_next_frame() -> anyhow::Result<()> {
    let device = HeadlessDevice::immediate();
    let mut renderer = renderer(SkinningSettings::default(), &device);
    let mut instance = spawn(&renderer, &device, 2);
    let id = instance.id();

    // Frame 1: object is created, distant view recorded after processing.
    update(&mut instance, &renderer, 0.0);
    let mut ctx = renderer.begin_frame(&device);
    renderer.process_commands(&mut ctx)?;
    renderer.update_lod(id, &view(), &bounds_at(10.0))?;
    renderer.transition_all_to_readable(&mut ctx);
    renderer.end_frame(ctx)?;
    assert_eq!(renderer.object(id).unwrap().processed_lod(), Some(0));

    // Frame 2: the first view of a new frame commits frame 1's result.
    update(&mut instance, &renderer, 0.0);
    let mut ctx = renderer.begin_frame(&device);
    renderer.update_lod(id, &view(), &bounds_at(10.0))?;
    renderer.process_commands(&mut ctx)?;
    renderer.transition_all_to_readable(&mut ctx);
    renderer.end_frame(ctx)?;
    assert_eq!(renderer.object(id).unwrap().processed_lod(), Some(1));
    Ok(())
}

#[test]
fn update_lod_of_unknown_object_errors() {
    let device = HeadlessDevice::immediate();
    let mut renderer = renderer(SkinningSettings::default(), &device);
    let id = InstanceId::next();
    let result = renderer.update_lod(id, &view(), &bounds_at(1.0));
    assert!(matches!(result, Err(SkinError::UnknownMeshObject(v)) if v == id.value()));
}

// ============================================================================
// Command Failure Tests
// ============================================================================

/// Like [`update`] but without cloth, so the section never allocates cloth buffers.
fn update_without_cloth(instance: &mut SkinnedMeshInstance, renderer: &SkinningRenderer) {
    instance
        .update(&InstanceUpdate {
            pose: &common::pose(0.0),
            morph_weights: &[0.6, 0.4],
            cloth: &[],
            cloth_blend_weight: 0.0,
            component_to_world: Mat4::IDENTITY,
            frame_number: renderer.frame_number() + 1,
            teleported: false,
        })
        .unwrap();
}

fn lose_cloth_allocations(device: &HeadlessDevice) {
    device.fail_allocations_labeled_with("Cloth Simulation", SkinError::InvalidHandle("device lost".into()));
}

#[test]
fn failing_command_does_not_drop_the_rest_of_the_queue() -> anyhow::Result<()> {
    let device = HeadlessDevice::immediate();
    let mut renderer = renderer(SkinningSettings::default(), &device);
    let mut clothed = spawn(&renderer, &device, 1);
    let mut plain = spawn(&renderer, &device, 1);
    let released = spawn(&renderer, &device, 1);
    let released_id = released.id();

    lose_cloth_allocations(&device);
    update(&mut clothed, &renderer, 0.0);
    update_without_cloth(&mut plain, &renderer);
    released.release()?;

    let mut ctx = renderer.begin_frame(&device);
    let result = renderer.process_commands(&mut ctx);
    assert!(matches!(result, Err(SkinError::InvalidHandle(_))));
    renderer.transition_all_to_readable(&mut ctx);
    renderer.end_frame(ctx)?;

    // Commands queued behind the failing commit were still handled.
    assert_eq!(renderer.object(clothed.id()).unwrap().last_revision(), None);
    assert!(renderer.object(plain.id()).unwrap().last_revision().is_some());
    assert!(renderer.object(released_id).is_none());

    device.clear_allocation_failures();
    update(&mut clothed, &renderer, 1.0);
    run_frame(&mut renderer, &device)?;
    assert!(renderer.object(clothed.id()).unwrap().last_revision().is_some());
    Ok(())
}

#[test]
fn failing_deferred_commit_does_not_skip_other_objects() -> anyhow::Result<()> {
    let device = HeadlessDevice::immediate();
    let settings = SkinningSettings {
        commit_policy: CommitPolicy::DeferUntilPreFrame,
        ..Default::default()
    };
    let mut renderer = renderer(settings, &device);
    let mut clothed = spawn(&renderer, &device, 1);
    let mut plain = spawn(&renderer, &device, 1);

    update(&mut clothed, &renderer, 0.0);
    update_without_cloth(&mut plain, &renderer);
    let mut ctx = renderer.begin_frame(&device);
    assert_eq!(renderer.process_commands(&mut ctx)?, 4);
    assert_eq!(renderer.deferred_count(), 2);

    lose_cloth_allocations(&device);
    let result = renderer.pre_frame_commit(&mut ctx);
    assert!(matches!(result, Err(SkinError::InvalidHandle(_))));
    assert_eq!(renderer.deferred_count(), 0);
    assert_eq!(renderer.object(clothed.id()).unwrap().last_revision(), None);
    assert!(renderer.object(plain.id()).unwrap().last_revision().is_some());
    renderer.transition_all_to_readable(&mut ctx);
    renderer.end_frame(ctx)?;
    Ok(())
}

// ============================================================================
// Lifetime Tests
// ============================================================================

#[test]
fn release_returns_pooled_memory_after_the_fence() -> anyhow::Result<()> {
    let device = HeadlessDevice::manual();
    let mut renderer = renderer(SkinningSettings::default(), &device);
    let mut instance = spawn(&renderer, &device, 1);

    update(&mut instance, &renderer, 0.0);
    run_frame(&mut renderer, &device)?;
    assert_eq!(renderer.skin_cache().entry_count(), 3);

    instance.release()?;
    let fence = run_frame(&mut renderer, &device)?;
    assert_eq!(renderer.object_count(), 0);
    assert_eq!(renderer.skin_cache().entry_count(), 0);
    assert_eq!(renderer.skin_cache().pool_stats().in_use_count, 0);
    assert!(renderer.skin_cache().pool_stats().pending_count > 0);

    device.signal_through(fence);
    run_frame(&mut renderer, &device)?;
    assert_eq!(renderer.skin_cache().pool_stats().pending_count, 0);
    assert_eq!(renderer.resources().bone_pool.stats().pending_count, 0);
    assert_eq!(renderer.resources().retired_snapshot_count(), 0);
    Ok(())
}

#[test]
fn shutdown_leaves_only_static_buffers() -> anyhow::Result<()> {
    let device = HeadlessDevice::manual();
    let mut renderer = renderer(SkinningSettings::default(), &device);
    let mut instances: Vec<_> = (0..3).map(|_| spawn(&renderer, &device, 2)).collect();

    for frame in 0..4 {
        for (i, instance) in instances.iter_mut().enumerate() {
            instance.set_forced_lod(((frame + i) % 2 == 1).then_some(1));
            update(instance, &renderer, frame as f32);
        }
        run_frame(&mut renderer, &device)?;
    }
    assert!(device.pending_fence_count() > 0);

    // Dropping the handles queues their release for the shutdown frame.
    drop(instances);
    renderer.shutdown(&device)?;

    assert_eq!(renderer.object_count(), 0);
    assert_eq!(device.live_buffer_count(), 3 * common::static_buffer_count(2));
    assert_eq!(renderer.skin_cache().pool_stats().allocated_bytes, 0);
    assert_eq!(renderer.resources().bone_pool.stats().allocated_bytes, 0);
    assert_eq!(renderer.resources().cloth_pool.stats().allocated_bytes, 0);
    let pool = renderer.snapshot_pool();
    assert_eq!(pool.free_count() as u64, pool.created_count());
    Ok(())
}
