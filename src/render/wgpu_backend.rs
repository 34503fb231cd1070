//! wgpu render backend: the textured-quad pipeline and per-tick submission

use std::collections::HashMap;
use std::iter;
use std::sync::Arc;

use tracing::{info, instrument};
use wgpu::{
    AddressMode, BindGroupDescriptor, BindGroupEntry, BindGroupLayout, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, BindingResource, BindingType, BlendState, Color, ColorTargetState,
    ColorWrites, CommandEncoderDescriptor, Device, ErrorFilter, FilterMode, FragmentState,
    FrontFace, LoadOp, Maintain, MultisampleState, Operations, PipelineCompilationOptions,
    PipelineLayoutDescriptor, PolygonMode, PrimitiveState, PrimitiveTopology, Queue,
    RenderPassColorAttachment, RenderPassDescriptor, RenderPipeline, RenderPipelineDescriptor,
    Sampler, SamplerBindingType, SamplerDescriptor, ShaderModuleDescriptor, ShaderSource,
    ShaderStages, StoreOp, SurfaceTexture, TextureSampleType, TextureViewDescriptor,
    TextureViewDimension, VertexState,
};

use super::synchronizer::{Completion, QuadDraw, RenderBackend, Topology};
use crate::error::RenderError;
use crate::gpu::{Texture, TextureFormat, WgpuGpu, WgpuPlane};

pub const SHADER_SOURCE: &str = include_str!("shader.wgsl");

impl Topology {
    pub fn to_wgpu(self) -> PrimitiveTopology {
        match self {
            Topology::TriangleList => PrimitiveTopology::TriangleList,
            Topology::TriangleStrip => PrimitiveTopology::TriangleStrip,
        }
    }
}

/// Device handles passed to post-render hooks
#[derive(Clone)]
pub struct WgpuHandles {
    pub device: Arc<Device>,
    pub queue: Arc<Queue>,
}

pub struct WgpuBackend {
    device: Arc<Device>,
    queue: Arc<Queue>,
    bind_group_layout: BindGroupLayout,
    sampler: Sampler,
    color: RenderPipeline,
    luma: RenderPipeline,
}

impl WgpuBackend {
    /// Build both pipeline variants for `target_format`.
    ///
    /// # Panics
    ///
    /// If the pipelines fail validation; rendering cannot proceed without them.
    #[instrument(skip(gpu))]
    pub fn new(gpu: &WgpuGpu, target_format: wgpu::TextureFormat) -> Self {
        let device = gpu.device.clone();
        device.push_error_scope(ErrorFilter::Validation);

        let shader = device.create_shader_module(ShaderModuleDescriptor {
            label: Some("camtex quad shader"),
            source: ShaderSource::Wgsl(SHADER_SOURCE.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("camtex frame layout"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Texture {
                        sample_type: TextureSampleType::Float { filterable: true },
                        view_dimension: TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Sampler(SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("camtex quad pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = |label: &str, luma_only: bool| {
            let constants = HashMap::from([("LUMA_ONLY".to_string(), f64::from(u8::from(luma_only)))]);
            device.create_render_pipeline(&RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                cache: None,
                vertex: VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[],
                },
                fragment: Some(FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    compilation_options: PipelineCompilationOptions {
                        constants: &constants,
                        zero_initialize_workgroup_memory: false,
                    },
                    targets: &[Some(ColorTargetState {
                        format: target_format,
                        blend: Some(BlendState::REPLACE),
                        write_mask: ColorWrites::ALL,
                    })],
                }),
                primitive: PrimitiveState {
                    topology: QuadDraw::FULL_SCREEN.topology.to_wgpu(),
                    strip_index_format: None,
                    front_face: FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: None,
                multisample: MultisampleState::default(),
                multiview: None,
            })
        };
        let color = pipeline("camtex color pipeline", false);
        let luma = pipeline("camtex luma pipeline", true);

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            panic!("render pipeline failed to build: {error}");
        }

        let sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("camtex frame sampler"),
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            address_mode_w: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            ..Default::default()
        });

        info!(?target_format, "render pipelines ready");
        Self {
            device,
            queue: gpu.queue.clone(),
            bind_group_layout,
            sampler,
            color,
            luma,
        }
    }
}

impl RenderBackend for WgpuBackend {
    type Target = SurfaceTexture;
    type Handles = WgpuHandles;

    /// Completion callbacks only fire from inside a poll
    fn poll(&self) {
        let _ = self.device.poll(Maintain::Wait);
    }

    fn pipeline_ready(&self) -> bool {
        true
    }

    fn submit(
        &mut self,
        target: SurfaceTexture,
        texture: &Texture,
        draw: QuadDraw,
        on_complete: Completion<WgpuHandles>,
    ) -> Result<(), RenderError> {
        let plane = texture
            .resource::<WgpuPlane>()
            .ok_or(RenderError::UnsupportedTexture(texture.key()))?;
        let pipeline = match texture.format() {
            TextureFormat::R8Unorm => &self.luma,
            TextureFormat::Rg8Unorm | TextureFormat::Bgra8Unorm => &self.color,
        };

        let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("camtex frame bind group"),
            layout: &self.bind_group_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::TextureView(&plane.view),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        let view = target.texture.create_view(&TextureViewDescriptor::default());
        let mut encoder = self.device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("camtex frame encoder"),
        });

        {
            let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("camtex frame pass"),
                color_attachments: &[Some(RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Clear(Color::BLACK),
                        store: StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });

            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.draw(0..draw.vertex_count, 0..draw.instance_count);
        }

        self.queue.submit(iter::once(encoder.finish()));

        let handles = WgpuHandles {
            device: self.device.clone(),
            queue: self.queue.clone(),
        };
        self.queue.on_submitted_work_done(move || on_complete(handles));
        target.present();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use naga::valid::{Capabilities, ValidationFlags, Validator};

    fn validate_shader(source: &str) -> naga::Module {
        let module = naga::front::wgsl::parse_str(source).expect("shader should parse");
        Validator::new(ValidationFlags::all(), Capabilities::all())
            .validate(&module)
            .expect("shader should validate");
        module
    }

    #[test]
    fn quad_shader_validates() {
        let module = validate_shader(SHADER_SOURCE);

        let entry_points: Vec<_> = module.entry_points.iter().map(|e| e.name.as_str()).collect();
        assert!(entry_points.contains(&"vs_main"));
        assert!(entry_points.contains(&"fs_main"));
    }

    #[test]
    fn luma_switch_is_overridable() {
        let module = validate_shader(SHADER_SOURCE);
        assert!(module
            .overrides
            .iter()
            .any(|(_, o)| o.name.as_deref() == Some("LUMA_ONLY")));
    }

    #[test]
    fn topology_maps_to_wgpu() {
        assert_eq!(
            QuadDraw::FULL_SCREEN.topology.to_wgpu(),
            PrimitiveTopology::TriangleStrip
        );
    }
}
