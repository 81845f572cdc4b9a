mod common;

use common::{adapter, config, offscreen_device, EXTENT};
use novade_gpu_core::ash::vk;
use novade_gpu_core::command::ImageTransition;
use novade_gpu_core::render_pass::AttachmentDesc;
use novade_gpu_core::{
    CoreConfig, CoreError, DeviceBuilder, Image, ImageDesc, RenderPass, Submission, Visibility,
};
use rstest::rstest;
use std::collections::HashSet;

#[test]
fn slots_rotate_round_robin() {
    let config = config();
    let Some(mut gpu) = offscreen_device(&config) else {
        return;
    };
    let mut queue = gpu.device.take_queue(gpu.graphics).unwrap();
    let n = queue.slot_count();
    assert_eq!(n, config.command_ring_size);

    let lap: Vec<_> = (0..n).map(|_| queue.next_slot()).collect();
    let distinct: HashSet<_> = lap.iter().copied().collect();
    assert_eq!(distinct.len(), n);
    assert_eq!(queue.next_slot(), lap[0]);
}

#[rstest]
#[case::empty_command_ring(CoreConfig { command_ring_size: 0, ..config() })]
#[case::no_descriptor_generations(CoreConfig { descriptor_generations: 0, ..config() })]
#[case::too_many_frames(CoreConfig { frames_in_flight: 3, descriptor_generations: 2, ..config() })]
fn invalid_ring_sizes_are_rejected_before_device_creation(#[case] invalid: CoreConfig) {
    let Some(adapter) = adapter(&config()) else {
        return;
    };
    assert!(matches!(
        DeviceBuilder::new(adapter, None, &invalid),
        Err(CoreError::Config(_))
    ));
}

#[test]
fn tickets_redeem_once() {
    let config = config();
    let Some(mut gpu) = offscreen_device(&config) else {
        return;
    };
    gpu.device.take_queue(gpu.graphics).unwrap();
    assert!(matches!(
        gpu.device.take_queue(gpu.graphics),
        Err(CoreError::QueueUnavailable(_))
    ));
}

#[test]
fn failed_recording_still_ends_the_command_buffer() {
    let config = config();
    let Some(mut gpu) = offscreen_device(&config) else {
        return;
    };
    let mut queue = gpu.device.take_queue(gpu.graphics).unwrap();
    let slot = queue.next_slot();

    let result: novade_gpu_core::Result<()> =
        queue.record(slot, |_| Err(CoreError::Config("abandoned".into())));
    assert!(matches!(result, Err(CoreError::Config(_))));

    // The slot is reusable: the previous session was ended, so reset/begin succeed.
    let image = Image::new(
        &gpu.device,
        ImageDesc::new(EXTENT, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::STORAGE),
        Visibility::DeviceLocal,
    )
    .unwrap();
    queue
        .record(slot, |rec| {
            rec.transition_image(
                &image,
                ImageTransition::new(vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL),
            );
            Ok(())
        })
        .unwrap();
    let fence = gpu.device.fence(false).unwrap();
    queue.submit(slot, Submission::new().fence(&fence)).unwrap();
    gpu.device.wait(&fence).unwrap();
    assert!(!fence.is_signaled().unwrap());
}

#[test]
fn framebuffer_cache_holds_every_permutation() {
    let config = config();
    let Some(gpu) = offscreen_device(&config) else {
        return;
    };
    let format = vk::Format::R8G8B8A8_UNORM;
    let color = |_: usize| {
        Image::new(
            &gpu.device,
            ImageDesc::new(EXTENT, format, vk::ImageUsageFlags::COLOR_ATTACHMENT),
            Visibility::DeviceLocal,
        )
        .unwrap()
    };
    let first: Vec<Image> = (0..2).map(color).collect();
    let second: Vec<Image> = (0..3).map(color).collect();

    let attachment = AttachmentDesc::color(
        format,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    );
    let mut pass = RenderPass::new(
        &gpu.device,
        vk::PipelineBindPoint::GRAPHICS,
        &[],
        &[attachment, attachment],
        None,
    )
    .unwrap();

    let lists = vec![
        first.iter().map(Image::view).collect::<Vec<_>>(),
        second.iter().map(Image::view).collect::<Vec<_>>(),
    ];
    let range = pass.framebuffers(&lists, EXTENT).unwrap();
    assert_eq!(range, 0..6);

    let cycle: Vec<_> = (0..6).map(|_| pass.current().unwrap()).collect();
    let distinct: HashSet<_> = cycle.iter().copied().collect();
    assert_eq!(distinct.len(), 6);
    assert_eq!(pass.current(), Some(cycle[0]));

    let views = [first[1].view(), second[2].view()];
    assert!(pass.framebuffer_for(&views).is_some());

    assert!(matches!(
        pass.framebuffers(&lists[..1], EXTENT),
        Err(CoreError::AttachmentMismatch {
            expected: 2,
            got: 1
        })
    ));
    // Appending keeps earlier entries.
    let again = pass.framebuffers(&lists, EXTENT).unwrap();
    assert_eq!(again, 6..12);
    assert_eq!(pass.framebuffer_count(), 12);
}
