use super::context::{FrameTextures, FullscreenPass, GpuContext, GpuTexture};
use super::{GpuStage, StageContext, StageOutcome};
use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

/// Vertical then horizontal passes per iteration
const BLUR_ITERATIONS: usize = 3;

const BLUR_SHADER: &str = r#"
struct Params {
    texel_size: vec2<f32>,
    _pad: vec2<f32>,
};

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var linear_sampler: sampler;
@group(0) @binding(2) var input_frame: texture_2d<f32>;
@group(0) @binding(3) var person_mask: texture_2d<f32>;

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    var offsets = array<f32, 5>(0.0, 1.0, 2.0, 3.0, 4.0);
    var weights = array<f32, 5>(
        0.2270270270, 0.1945945946, 0.1216216216, 0.0540540541, 0.0162162162
    );

    let center = textureSampleLevel(input_frame, linear_sampler, in.uv, 0.0);
    let center_weight = weights[0] * (1.0 - textureSampleLevel(person_mask, linear_sampler, in.uv, 0.0).r);
    var color = center * center_weight;

    for (var i = 1; i < 5; i++) {
        let shift = vec2<f32>(offsets[i]) * params.texel_size;

        var coord = in.uv + shift;
        var weight = weights[i] * (1.0 - textureSampleLevel(person_mask, linear_sampler, coord, 0.0).r);
        color += textureSampleLevel(input_frame, linear_sampler, coord, 0.0) * weight;

        coord = in.uv - shift;
        weight = weights[i] * (1.0 - textureSampleLevel(person_mask, linear_sampler, coord, 0.0).r);
        color += textureSampleLevel(input_frame, linear_sampler, coord, 0.0) * weight;
    }

    return vec4<f32>(color.rgb + (1.0 - color.a) * center.rgb, 1.0);
}
"#;

const BLEND_SHADER: &str = r#"
struct Params {
    coverage: vec2<f32>,
    _pad: vec2<f32>,
};

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var linear_sampler: sampler;
@group(0) @binding(2) var input_frame: texture_2d<f32>;
@group(0) @binding(3) var background: texture_2d<f32>;
@group(0) @binding(4) var person_mask: texture_2d<f32>;

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    let frame_color = textureSampleLevel(input_frame, linear_sampler, in.uv, 0.0).rgb;
    let background_color = textureSampleLevel(background, linear_sampler, in.uv, 0.0).rgb;
    let mask = textureSampleLevel(person_mask, linear_sampler, in.uv, 0.0).r;
    let person = smoothstep(params.coverage.x, params.coverage.y, mask);
    return vec4<f32>(mix(background_color, frame_color, person), 1.0);
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BlurParams {
    texel_size: [f32; 2],
    _pad: [f32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BlendParams {
    coverage: [f32; 2],
    _pad: [f32; 2],
}

/// Masked separable Gaussian at half resolution, then a blend of the sharp
/// person over the blurred background.
///
/// Taps are weighted by `1 - mask` so the person never bleeds into the
/// background.
pub(crate) struct BackgroundBlurStage {
    blur: FullscreenPass,
    blend: FullscreenPass,
    uniforms: Vec<wgpu::Buffer>,
    first_vertical: wgpu::BindGroup,
    vertical: wgpu::BindGroup,
    horizontal: wgpu::BindGroup,
    blend_group: wgpu::BindGroup,
    vertical_target: GpuTexture,
    horizontal_target: GpuTexture,
}

impl BackgroundBlurStage {
    pub fn new(gpu: &GpuContext, textures: &FrameTextures, coverage: (f32, f32)) -> Self {
        let format = wgpu::TextureFormat::Rgba8Unorm;
        let (width, height) = (
            (textures.output.width / 2).max(1),
            (textures.output.height / 2).max(1),
        );
        let usage = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
        let vertical_target = GpuTexture::new(gpu, "blur vertical", width, height, format, usage);
        let horizontal_target =
            GpuTexture::new(gpu, "blur horizontal", width, height, format, usage);

        let texel = [1.0 / width as f32, 1.0 / height as f32];
        let uniform = |label: &str, contents: &[u8]| {
            gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            })
        };
        let vertical_params = uniform(
            "blur vertical params",
            bytemuck::bytes_of(&BlurParams {
                texel_size: [0.0, texel[1]],
                _pad: [0.0; 2],
            }),
        );
        let horizontal_params = uniform(
            "blur horizontal params",
            bytemuck::bytes_of(&BlurParams {
                texel_size: [texel[0], 0.0],
                _pad: [0.0; 2],
            }),
        );
        let blend_params = uniform(
            "blur blend params",
            bytemuck::bytes_of(&BlendParams {
                coverage: [coverage.0, coverage.1],
                _pad: [0.0; 2],
            }),
        );

        let blur = FullscreenPass::new(gpu, "background blur", BLUR_SHADER, format);
        let blend = FullscreenPass::new(gpu, "background blend", BLEND_SHADER, format);
        let sampler = wgpu::BindingResource::Sampler(&gpu.sampler);
        let mask = wgpu::BindingResource::TextureView(&textures.person_mask.view);

        let first_vertical = blur.bind(
            gpu,
            &[
                vertical_params.as_entire_binding(),
                sampler.clone(),
                wgpu::BindingResource::TextureView(&textures.input.view),
                mask.clone(),
            ],
        );
        let vertical = blur.bind(
            gpu,
            &[
                vertical_params.as_entire_binding(),
                sampler.clone(),
                wgpu::BindingResource::TextureView(&horizontal_target.view),
                mask.clone(),
            ],
        );
        let horizontal = blur.bind(
            gpu,
            &[
                horizontal_params.as_entire_binding(),
                sampler.clone(),
                wgpu::BindingResource::TextureView(&vertical_target.view),
                mask.clone(),
            ],
        );
        let blend_group = blend.bind(
            gpu,
            &[
                blend_params.as_entire_binding(),
                sampler,
                wgpu::BindingResource::TextureView(&textures.input.view),
                wgpu::BindingResource::TextureView(&horizontal_target.view),
                mask,
            ],
        );

        Self {
            blur,
            blend,
            uniforms: vec![vertical_params, horizontal_params, blend_params],
            first_vertical,
            vertical,
            horizontal,
            blend_group,
            vertical_target,
            horizontal_target,
        }
    }
}

impl GpuStage for BackgroundBlurStage {
    fn name(&self) -> &'static str {
        "background blur"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
        let mut encoder = ctx.gpu.encoder("background blur");

        for iteration in 0..BLUR_ITERATIONS {
            let source = if iteration == 0 {
                &self.first_vertical
            } else {
                &self.vertical
            };
            let vertical = &self.vertical_target.view;
            self.blur.draw(&mut encoder, source, vertical);
            let horizontal = &self.horizontal_target.view;
            self.blur.draw(&mut encoder, &self.horizontal, horizontal);
        }
        let output = &ctx.textures.output.view;
        self.blend.draw(&mut encoder, &self.blend_group, output);

        ctx.gpu.submit(encoder);
        Ok(StageOutcome::Continue)
    }

    fn release(&mut self) {
        for buffer in &self.uniforms {
            buffer.destroy();
        }
        self.horizontal_target.destroy();
        self.vertical_target.destroy();
    }
}
