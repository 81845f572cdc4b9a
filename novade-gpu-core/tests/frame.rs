mod common;

use bytemuck::{Pod, Zeroable};
use common::{compiler, config, headless_device, offscreen_device, EXTENT};
use novade_gpu_core::ash::vk;
use novade_gpu_core::command::{BufferTransition, ImageTransition, RenderingAttachment};
use novade_gpu_core::descriptor::DescriptorBinding;
use novade_gpu_core::{
    Buffer, CoreError, DescriptorResource, FrameSynchronizer, GraphicsPipelineDesc, Image,
    ImageDesc, Pipeline, RenderTarget, ShaderModule, ShaderStage, Submission, VertexInputBinding,
    Visibility,
};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 3],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.5, 0.0],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        position: [0.5, 0.5, 0.0],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        position: [-0.5, 0.5, 0.0],
        color: [0.0, 0.0, 1.0],
    },
];

#[test]
fn triangle_frames_present_and_fence_once_per_frame() {
    let config = config();
    let Some(compiler) = compiler(&config) else {
        return;
    };
    let Some(mut gpu) = headless_device(&config) else {
        return;
    };
    let Some(present_ticket) = gpu.present else {
        return;
    };
    let mut graphics_queue = gpu.device.take_queue(gpu.graphics).unwrap();
    let present_queue = gpu.device.take_queue(present_ticket).unwrap();

    let mut vertices = Buffer::new(
        &gpu.device,
        vk::BufferUsageFlags::VERTEX_BUFFER,
        Visibility::DeviceLocal,
        std::mem::size_of_val(&TRIANGLE) as u64,
    )
    .unwrap();
    vertices.write(&TRIANGLE).unwrap();

    let vert = ShaderModule::compile(
        &gpu.device,
        &compiler,
        "triangle.vert",
        include_str!("../shaders/triangle.vert"),
        ShaderStage::Vertex,
    )
    .unwrap();
    let frag = ShaderModule::compile(
        &gpu.device,
        &compiler,
        "triangle.frag",
        include_str!("../shaders/triangle.frag"),
        ShaderStage::Fragment,
    )
    .unwrap();

    let swapchain_format = gpu.device.swapchain().unwrap().format();
    let color_formats = [swapchain_format];
    let desc = GraphicsPipelineDesc::new(
        &[&vert, &frag],
        RenderTarget::Dynamic {
            color_formats: &color_formats,
            depth_format: vk::Format::UNDEFINED,
        },
    )
    .vertex_binding(
        VertexInputBinding::packed(
            0,
            &[vk::Format::R32G32B32_SFLOAT, vk::Format::R32G32B32_SFLOAT],
        )
        .unwrap(),
    )
    .push_constant(vk::ShaderStageFlags::VERTEX, 0, 8);
    if !gpu.device.context().dynamic_rendering() {
        assert!(matches!(
            Pipeline::graphics(&gpu.device, &desc),
            Err(CoreError::DynamicRenderingUnsupported)
        ));
        return;
    }
    let pipeline = Pipeline::graphics(&gpu.device, &desc).unwrap();
    assert!(pipeline.bound_sets().is_empty());

    let mut frames = FrameSynchronizer::new(&gpu.device, config.frames_in_flight).unwrap();
    let extent = gpu.device.swapchain().unwrap().extent();
    let area = vk::Rect2D {
        offset: vk::Offset2D::default(),
        extent,
    };

    for frame_number in 0..3u32 {
        let frame = match frames.begin_frame(&gpu.device) {
            Ok(frame) => frame,
            Err(CoreError::SwapchainOutOfDate) => {
                gpu.device.recreate_swapchain(EXTENT).unwrap();
                continue;
            }
            Err(e) => panic!("begin_frame failed: {e}"),
        };
        let sync = frames.get(frame).unwrap();
        // Reset by begin_frame; the GPU has not signaled it yet for this frame.
        assert!(!sync.in_flight().is_signaled().unwrap());

        let target = gpu.device.swapchain_image(frame.image_index).unwrap();
        let slot = graphics_queue.next_slot();
        let offset = [0.1 * frame_number as f32, 0.0f32];
        graphics_queue
            .record(slot, |rec| {
                rec.transition_image(
                    target,
                    ImageTransition::new(
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    )
                    .access(vk::AccessFlags::empty(), vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                    .stages(
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    ),
                );
                rec.begin_rendering(
                    &[RenderingAttachment::color(
                        target.view(),
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        [0.0, 0.0, 0.0, 1.0],
                    )],
                    None,
                    area,
                )?;
                pipeline.bind(rec);
                rec.push_constants(&pipeline, 0, &offset)?;
                rec.set_render_area(area);
                rec.bind_vertex_buffers(0, &[&vertices]);
                rec.draw(3, 1, 0, 0);
                rec.end_rendering();
                rec.transition_image(
                    target,
                    ImageTransition::new(
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        vk::ImageLayout::PRESENT_SRC_KHR,
                    )
                    .access(vk::AccessFlags::COLOR_ATTACHMENT_WRITE, vk::AccessFlags::empty())
                    .stages(
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    ),
                );
                Ok(())
            })
            .unwrap();

        graphics_queue
            .submit(
                slot,
                Submission::new()
                    .wait(
                        sync.image_available(),
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    )
                    .signal(sync.present_ready())
                    .fence(sync.in_flight()),
            )
            .unwrap();

        sync.in_flight().wait().unwrap();
        assert!(sync.in_flight().is_signaled().unwrap());

        match frames.present(&present_queue, &gpu.device, frame) {
            Ok(_) => {}
            Err(CoreError::SwapchainOutOfDate) => gpu.device.recreate_swapchain(EXTENT).unwrap(),
            Err(e) => panic!("present failed: {e}"),
        }
    }
    gpu.device.idle().unwrap();
    assert!(frames.frames_presented() >= 1);
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Fill {
    color: [f32; 4],
}

#[test]
fn compute_fill_rotates_descriptor_generations() {
    let config = config();
    let Some(compiler) = compiler(&config) else {
        return;
    };
    let Some(mut gpu) = offscreen_device(&config) else {
        return;
    };
    let mut queue = gpu.device.take_queue(gpu.graphics).unwrap();

    let shader = ShaderModule::compile(
        &gpu.device,
        &compiler,
        "fill.comp",
        include_str!("../shaders/fill.comp"),
        ShaderStage::Compute,
    )
    .unwrap();
    let stages = vk::ShaderStageFlags::COMPUTE;
    let sets = vec![vec![
        DescriptorBinding::uniform_buffer(stages),
        DescriptorBinding::storage_image(stages),
    ]];
    let mut pipeline = Pipeline::compute(&gpu.device, &shader, &sets, &[]).unwrap();
    let generations = pipeline.descriptors().generations();
    assert_eq!(generations.set_count(), 1);
    assert_eq!(generations.all().count(), config.descriptor_generations);

    let colors = [[1.0f32, 0.0, 0.0, 1.0], [0.0, 0.0, 1.0, 1.0]];
    let targets: Vec<Image> = colors
        .iter()
        .map(|_| {
            Image::new(
                &gpu.device,
                ImageDesc::new(
                    EXTENT,
                    vk::Format::R8G8B8A8_UNORM,
                    vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
                ),
                Visibility::DeviceLocal,
            )
            .unwrap()
        })
        .collect();
    let uniforms: Vec<Buffer> = colors
        .iter()
        .map(|color| {
            let mut uniform = Buffer::new(
                &gpu.device,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                Visibility::HostVisible,
                std::mem::size_of::<Fill>() as u64,
            )
            .unwrap();
            uniform.write(&[Fill { color: *color }]).unwrap();
            uniform
        })
        .collect();
    let pixel_bytes = (EXTENT.width * EXTENT.height * 4) as u64;
    let mut readbacks: Vec<Buffer> = colors
        .iter()
        .map(|_| {
            Buffer::new(
                &gpu.device,
                vk::BufferUsageFlags::TRANSFER_DST,
                Visibility::HostVisible,
                pixel_bytes,
            )
            .unwrap()
        })
        .collect();

    // Both dispatches go into one command buffer. The second write must land
    // in a different generation or it would rewrite the set the first
    // dispatch already bound.
    let fence = gpu.device.fence(false).unwrap();
    let slot = queue.next_slot();
    let bound = queue
        .record(slot, |rec| {
            let mut bound = Vec::new();
            for (uniform, target) in uniforms.iter().zip(&targets) {
                pipeline.advance(0)?;
                pipeline.write(0, 0, DescriptorResource::buffer(uniform))?;
                pipeline.write(0, 1, DescriptorResource::storage_image(target))?;
                bound.push(pipeline.bound_sets()[0]);
                rec.transition_image(
                    target,
                    ImageTransition::new(vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL)
                        .access(vk::AccessFlags::empty(), vk::AccessFlags::SHADER_WRITE)
                        .stages(
                            vk::PipelineStageFlags::TOP_OF_PIPE,
                            vk::PipelineStageFlags::COMPUTE_SHADER,
                        ),
                );
                rec.bind_pipeline(&pipeline);
                rec.dispatch(EXTENT.width / 8, EXTENT.height / 8, 1);
            }
            for (target, readback) in targets.iter().zip(&readbacks) {
                rec.transition_image(
                    target,
                    ImageTransition::new(
                        vk::ImageLayout::GENERAL,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    )
                    .access(vk::AccessFlags::SHADER_WRITE, vk::AccessFlags::TRANSFER_READ)
                    .stages(
                        vk::PipelineStageFlags::COMPUTE_SHADER,
                        vk::PipelineStageFlags::TRANSFER,
                    ),
                );
                rec.copy_image_to_buffer(target, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, readback)?;
                rec.transition_buffer(
                    readback,
                    BufferTransition {
                        src_access: vk::AccessFlags::TRANSFER_WRITE,
                        dst_access: vk::AccessFlags::HOST_READ,
                        src_stage: vk::PipelineStageFlags::TRANSFER,
                        dst_stage: vk::PipelineStageFlags::HOST,
                    },
                );
            }
            Ok(bound)
        })
        .unwrap();
    queue.submit(slot, Submission::new().fence(&fence)).unwrap();
    gpu.device.wait(&fence).unwrap();

    assert_ne!(bound[0], bound[1]);
    let expected: [[u8; 4]; 2] = [[255, 0, 0, 255], [0, 0, 255, 255]];
    for (readback, rgba) in readbacks.iter_mut().zip(expected) {
        let pixels = readback
            .mapped(|bytes| bytes[..pixel_bytes as usize].to_vec())
            .unwrap();
        assert!(
            pixels.chunks_exact(4).all(|texel| texel == rgba),
            "expected every texel to be {rgba:?}"
        );
    }

    assert!(matches!(
        pipeline.write(1, 0, DescriptorResource::buffer(&uniforms[0])),
        Err(CoreError::UnknownDescriptorSet { set: 1, binding: 0 })
    ));
    assert!(matches!(
        pipeline.write(0, 5, DescriptorResource::buffer(&uniforms[0])),
        Err(CoreError::UnknownDescriptorSet { set: 0, binding: 5 })
    ));
    gpu.device.idle().unwrap();
}

#[test]
fn wait_all_covers_every_frame_in_flight() {
    let config = config();
    let Some(mut gpu) = offscreen_device(&config) else {
        return;
    };
    let mut queue = gpu.device.take_queue(gpu.graphics).unwrap();
    let frames = FrameSynchronizer::new(&gpu.device, 2).unwrap();
    assert_eq!(frames.frames().count(), 2);

    // Fences start signaled; waiting must not reset them.
    frames.wait_all().unwrap();
    assert!(frames.frames().all(|sync| sync.in_flight().is_signaled().unwrap()));

    // Submit work on the slot that is not current, as the previous frame would.
    let previous = frames.frames().nth(1).unwrap();
    previous.in_flight().reset().unwrap();
    let slot = queue.next_slot();
    queue.record(slot, |_| Ok(())).unwrap();
    queue
        .submit(slot, Submission::new().fence(previous.in_flight()))
        .unwrap();

    frames.wait_all().unwrap();
    assert!(previous.in_flight().is_signaled().unwrap());
    assert!(frames.current().unwrap().in_flight().is_signaled().unwrap());
}
