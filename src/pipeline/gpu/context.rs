//! Device, textures, passes and readback shared by the GPU stages.

use crate::config::SegmentationDims;
use crate::scheduler::SchedulingWorker;
use anyhow::{anyhow, bail, Context, Result};
use std::sync::mpsc::{self, TryRecvError};
use std::time::Duration;

/// Delay between fence checks after the first, immediate one
const FENCE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Full-screen triangle; `uv` runs (0,0) top-left to (1,1) bottom-right.
const FULLSCREEN_VERTEX: &str = r#"
struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VsOut {
    var positions = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -3.0),
        vec2<f32>(3.0, 1.0),
        vec2<f32>(-1.0, 1.0)
    );
    var uvs = array<vec2<f32>, 3>(
        vec2<f32>(0.0, 2.0),
        vec2<f32>(2.0, 0.0),
        vec2<f32>(0.0, 0.0)
    );
    var out: VsOut;
    out.position = vec4<f32>(positions[index], 0.0, 1.0);
    out.uv = uvs[index];
    return out;
}
"#;

pub(crate) struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub sampler: wgpu::Sampler,
}

impl GpuContext {
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| anyhow!("no GPU adapter available"))?;

        let info = adapter.get_info();
        tracing::info!("GPU adapter: {} ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("backdrop-fx device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults()
                    .using_resolution(adapter.limits()),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .context("Failed to create GPU device")?;

        device.on_uncaptured_error(Box::new(|err| {
            tracing::error!("Uncaptured GPU error: {}", err);
        }));

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("linear clamp sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Ok(Self {
            device,
            queue,
            sampler,
        })
    }

    /// Start collecting validation errors
    pub fn push_validation_scope(&self) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
    }

    /// Fail with the first validation error since the matching push
    pub fn pop_validation_scope(&self) -> Result<()> {
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(anyhow!("GPU validation error: {}", err)),
            None => Ok(()),
        }
    }

    pub fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    pub fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.queue.submit(std::iter::once(encoder.finish()));
    }
}

pub(crate) struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl GpuTexture {
    pub fn new(
        gpu: &GpuContext,
        label: &str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> Self {
        let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            texture,
            view,
            width,
            height,
        }
    }

    /// Replace the whole texture with tightly packed rows
    pub fn upload(&self, gpu: &GpuContext, bytes: &[u8], bytes_per_pixel: u32) {
        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(self.width * bytes_per_pixel),
                rows_per_image: Some(self.height),
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
    }

    pub fn destroy(&self) {
        self.texture.destroy();
    }
}

/// Textures that several stages read or write.
pub(crate) struct FrameTextures {
    /// Current camera frame, source resolution
    pub input: GpuTexture,
    /// Raw model output, segmentation resolution
    pub segmentation: GpuTexture,
    /// Refined person mask, source resolution
    pub person_mask: GpuTexture,
    /// Composited result
    pub output: GpuTexture,
}

impl FrameTextures {
    pub fn new(gpu: &GpuContext, width: u32, height: u32, dims: SegmentationDims) -> Self {
        use wgpu::TextureFormat::{R8Unorm, Rgba8Unorm};
        use wgpu::TextureUsages as Usage;

        Self {
            input: GpuTexture::new(
                gpu,
                "input frame",
                width,
                height,
                Rgba8Unorm,
                Usage::TEXTURE_BINDING | Usage::COPY_DST,
            ),
            segmentation: GpuTexture::new(
                gpu,
                "segmentation",
                dims.width,
                dims.height,
                R8Unorm,
                Usage::TEXTURE_BINDING | Usage::COPY_DST,
            ),
            person_mask: GpuTexture::new(
                gpu,
                "person mask",
                width,
                height,
                R8Unorm,
                Usage::RENDER_ATTACHMENT | Usage::TEXTURE_BINDING | Usage::COPY_SRC,
            ),
            output: GpuTexture::new(
                gpu,
                "output",
                width,
                height,
                Rgba8Unorm,
                Usage::RENDER_ATTACHMENT | Usage::COPY_SRC,
            ),
        }
    }

    pub fn destroy(&self) {
        self.output.destroy();
        self.person_mask.destroy();
        self.segmentation.destroy();
        self.input.destroy();
    }
}

/// One full-screen fragment pass with an auto-derived bind group layout.
///
/// Bindings are numbered in the order they are passed to [`bind`](Self::bind).
pub(crate) struct FullscreenPass {
    label: String,
    pipeline: wgpu::RenderPipeline,
}

impl FullscreenPass {
    pub fn new(gpu: &GpuContext, label: &str, fragment: &str, format: wgpu::TextureFormat) -> Self {
        let source = format!("{}\n{}", FULLSCREEN_VERTEX, fragment);
        let module = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let pipeline = gpu
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: None,
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &module,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });

        Self {
            label: label.to_string(),
            pipeline,
        }
    }

    pub fn bind(
        &self,
        gpu: &GpuContext,
        resources: &[wgpu::BindingResource<'_>],
    ) -> wgpu::BindGroup {
        let entries: Vec<wgpu::BindGroupEntry<'_>> = resources
            .iter()
            .enumerate()
            .map(|(binding, resource)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: resource.clone(),
            })
            .collect();

        gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&self.label),
            layout: &self.pipeline.get_bind_group_layout(0),
            entries: &entries,
        })
    }

    pub fn draw(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        bind_group: &wgpu::BindGroup,
        target: &wgpu::TextureView,
    ) {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(&self.label),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.draw(0..3, 0..1);
    }
}

/// Mappable copy of an RGBA8 texture.
pub(crate) struct Readback {
    buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    bytes_per_pixel: u32,
    padded_row: u32,
}

impl Readback {
    pub fn new(
        gpu: &GpuContext,
        label: &str,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
    ) -> Self {
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_row = (width * bytes_per_pixel).div_ceil(align) * align;

        let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        Self {
            buffer,
            width,
            height,
            bytes_per_pixel,
            padded_row,
        }
    }

    pub fn copy_from(&self, encoder: &mut wgpu::CommandEncoder, texture: &wgpu::Texture) {
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Wait for the submitted copy and hand every unpadded row to `row`
    pub fn read_rows<F>(&self, gpu: &GpuContext, fence: &mut FencePoller, mut row: F) -> Result<()>
    where
        F: FnMut(usize, &[u8]),
    {
        let slice = self.buffer.slice(..);
        fence.wait_mapped(&gpu.device, &slice)?;

        {
            let data = slice.get_mapped_range();
            let unpadded = (self.width * self.bytes_per_pixel) as usize;
            for (y, chunk) in data.chunks_exact(self.padded_row as usize).enumerate() {
                row(y, &chunk[..unpadded]);
            }
        }
        self.buffer.unmap();

        Ok(())
    }

    pub fn destroy(&self) {
        self.buffer.destroy();
    }
}

/// Waits on buffer mappings without blocking inside the driver: the device
/// is polled, and between polls the thread parks on a timer worker.
pub(crate) struct FencePoller {
    timer: SchedulingWorker<()>,
    next_id: u64,
}

impl FencePoller {
    pub fn new() -> Result<Self> {
        let timer = SchedulingWorker::spawn("gpu-fence").context("Failed to start fence poller")?;
        Ok(Self { timer, next_id: 0 })
    }

    pub fn wait_mapped(
        &mut self,
        device: &wgpu::Device,
        slice: &wgpu::BufferSlice<'_>,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        let mut delay = Duration::ZERO;
        loop {
            let _ = device.poll(wgpu::Maintain::Poll);

            match rx.try_recv() {
                Ok(result) => return result.context("GPU readback failed"),
                Err(TryRecvError::Empty) => {
                    self.next_id += 1;
                    self.timer.schedule(self.next_id, delay, ());
                    if self.timer.wait().is_none() {
                        bail!("fence poller is closed");
                    }
                    delay = FENCE_POLL_INTERVAL;
                }
                Err(TryRecvError::Disconnected) => bail!("GPU readback was dropped"),
            }
        }
    }

    pub fn close(&mut self) {
        self.timer.close();
    }
}
