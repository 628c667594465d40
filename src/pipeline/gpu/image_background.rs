use super::context::{FullscreenPass, GpuContext, GpuTexture};
use super::{GpuStage, StageContext, StageOutcome};
use crate::config::EffectOptions;
use crate::pipeline::{BackgroundImage, CoverCrop};
use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use image::buffer::ConvertBuffer;
use image::RgbaImage;
use wgpu::util::DeviceExt;

const IMAGE_SHADER: &str = r#"
struct Params {
    coverage: vec2<f32>,
    background_scale: vec2<f32>,
    background_offset: vec2<f32>,
    light_wrapping: f32,
    blend_mode: f32,
};

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var linear_sampler: sampler;
@group(0) @binding(2) var input_frame: texture_2d<f32>;
@group(0) @binding(3) var background: texture_2d<f32>;
@group(0) @binding(4) var person_mask: texture_2d<f32>;

fn screen(a: vec3<f32>, b: vec3<f32>) -> vec3<f32> {
    return 1.0 - (1.0 - a) * (1.0 - b);
}

fn linear_dodge(a: vec3<f32>, b: vec3<f32>) -> vec3<f32> {
    return a + b;
}

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    var frame_color = textureSampleLevel(input_frame, linear_sampler, in.uv, 0.0).rgb;
    let background_uv = in.uv * params.background_scale + params.background_offset;
    let background_color = textureSampleLevel(background, linear_sampler, background_uv, 0.0).rgb;

    var mask = textureSampleLevel(person_mask, linear_sampler, in.uv, 0.0).r;
    let light_wrap_mask = 1.0 - max(0.0, mask - params.coverage.y) / (1.0 - params.coverage.y);
    let light_wrap = params.light_wrapping * light_wrap_mask * background_color;

    frame_color = params.blend_mode * linear_dodge(frame_color, light_wrap)
        + (1.0 - params.blend_mode) * screen(frame_color, light_wrap);
    mask = smoothstep(params.coverage.x, params.coverage.y, mask);
    return vec4<f32>(frame_color * mask + background_color * (1.0 - mask), 1.0);
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ImageParams {
    coverage: [f32; 2],
    background_scale: [f32; 2],
    background_offset: [f32; 2],
    light_wrapping: f32,
    blend_mode: f32,
}

struct LoadedBackground {
    texture: GpuTexture,
    uniforms: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

/// Composites the person over a still image, cropped to cover the output,
/// with light wrapping along the mask edge.
///
/// Skips frames until the image has been decoded.
pub(crate) struct BackgroundImageStage {
    pass: FullscreenPass,
    image: BackgroundImage,
    loaded: Option<LoadedBackground>,
    coverage: (f32, f32),
    light_wrapping: f32,
    blend_mode: f32,
}

impl BackgroundImageStage {
    pub fn new(gpu: &GpuContext, image: BackgroundImage, options: &EffectOptions) -> Self {
        Self {
            pass: FullscreenPass::new(
                gpu,
                "background image",
                IMAGE_SHADER,
                wgpu::TextureFormat::Rgba8Unorm,
            ),
            image,
            loaded: None,
            coverage: options.coverage,
            light_wrapping: options.light_wrapping,
            blend_mode: options.blend_mode.weight(),
        }
    }

    /// Upload the image once it has arrived
    fn load(&mut self, ctx: &StageContext<'_>) -> Option<LoadedBackground> {
        let image = self.image.poll()?;
        let (width, height) = image.dimensions();
        let rgba: RgbaImage = image.convert();

        let texture = GpuTexture::new(
            ctx.gpu,
            "background image",
            width,
            height,
            wgpu::TextureFormat::Rgba8Unorm,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        texture.upload(ctx.gpu, rgba.as_raw(), 4);

        let output = &ctx.textures.output;
        let crop = CoverCrop::compute((width, height), (output.width, output.height));
        let params = ImageParams {
            coverage: [self.coverage.0, self.coverage.1],
            background_scale: crop.scale,
            background_offset: crop.offset,
            light_wrapping: self.light_wrapping,
            blend_mode: self.blend_mode,
        };
        let uniforms = ctx
            .gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("background image params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });

        let bind_group = self.pass.bind(
            ctx.gpu,
            &[
                uniforms.as_entire_binding(),
                wgpu::BindingResource::Sampler(&ctx.gpu.sampler),
                wgpu::BindingResource::TextureView(&ctx.textures.input.view),
                wgpu::BindingResource::TextureView(&texture.view),
                wgpu::BindingResource::TextureView(&ctx.textures.person_mask.view),
            ],
        );

        tracing::debug!("Background image crop: {:?}", crop);

        Some(LoadedBackground {
            texture,
            uniforms,
            bind_group,
        })
    }
}

impl GpuStage for BackgroundImageStage {
    fn name(&self) -> &'static str {
        "background image"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
        if self.loaded.is_none() {
            match self.load(ctx) {
                Some(loaded) => self.loaded = Some(loaded),
                None => return Ok(StageOutcome::Skip),
            }
        }

        if let Some(loaded) = &self.loaded {
            let mut encoder = ctx.gpu.encoder("background image");
            let output = &ctx.textures.output.view;
            self.pass.draw(&mut encoder, &loaded.bind_group, output);
            ctx.gpu.submit(encoder);
        }

        Ok(StageOutcome::Continue)
    }

    fn release(&mut self) {
        if let Some(loaded) = self.loaded.take() {
            loaded.uniforms.destroy();
            loaded.texture.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_block_is_std140_sized() {
        assert_eq!(std::mem::size_of::<ImageParams>(), 32);
    }
}
