use super::context::{FrameTextures, FullscreenPass, GpuContext, GpuTexture, Readback};
use super::{GpuStage, StageContext, StageOutcome};
use crate::config::SegmentationDims;
use crate::segmentation::Preprocessor;
use anyhow::Result;

const RESIZE_SHADER: &str = r#"
@group(0) @binding(0) var frame_sampler: sampler;
@group(0) @binding(1) var input_frame: texture_2d<f32>;

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    return vec4<f32>(textureSampleLevel(input_frame, frame_sampler, in.uv, 0.0).rgb, 1.0);
}
"#;

/// Uploads the camera frame, draws it at model resolution and reads the
/// result back into the backend's input region.
pub(crate) struct ResizeStage {
    pass: FullscreenPass,
    bind_group: wgpu::BindGroup,
    target: GpuTexture,
    readback: Readback,
    preprocessor: Preprocessor,
    rgba: Vec<u8>,
}

impl ResizeStage {
    pub fn new(gpu: &GpuContext, textures: &FrameTextures, dims: SegmentationDims) -> Self {
        let format = wgpu::TextureFormat::Rgba8Unorm;
        let pass = FullscreenPass::new(gpu, "resize", RESIZE_SHADER, format);
        let bind_group = pass.bind(
            gpu,
            &[
                wgpu::BindingResource::Sampler(&gpu.sampler),
                wgpu::BindingResource::TextureView(&textures.input.view),
            ],
        );
        let target = GpuTexture::new(
            gpu,
            "resized input",
            dims.width,
            dims.height,
            format,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );
        let readback = Readback::new(gpu, "resized input readback", dims.width, dims.height, 4);

        Self {
            pass,
            bind_group,
            target,
            readback,
            preprocessor: Preprocessor::new(dims),
            rgba: Vec::with_capacity(
                textures.input.width as usize * textures.input.height as usize * 4,
            ),
        }
    }
}

impl GpuStage for ResizeStage {
    fn name(&self) -> &'static str {
        "resize"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
        self.rgba.clear();
        for pixel in ctx.frame.pixels() {
            self.rgba.extend_from_slice(&[pixel[0], pixel[1], pixel[2], 255]);
        }
        ctx.textures.input.upload(ctx.gpu, &self.rgba, 4);

        let mut encoder = ctx.gpu.encoder("resize");
        self.pass.draw(&mut encoder, &self.bind_group, &self.target.view);
        self.readback.copy_from(&mut encoder, &self.target.texture);
        ctx.gpu.submit(encoder);

        let preprocessor = &self.preprocessor;
        let input = ctx.backend.input_region_mut();
        self.readback.read_rows(ctx.gpu, ctx.fence, |y, rgba| {
            preprocessor.write_rgba_row(y, rgba, input);
        })?;

        Ok(StageOutcome::Continue)
    }

    fn release(&mut self) {
        self.readback.destroy();
        self.target.destroy();
        self.rgba = Vec::new();
    }
}
