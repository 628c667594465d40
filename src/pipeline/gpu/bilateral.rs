use super::context::{FrameTextures, FullscreenPass, GpuContext};
use super::{GpuStage, StageContext, StageOutcome};
use crate::config::SegmentationDims;
use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

const BILATERAL_SHADER: &str = r#"
struct Params {
    texel_size: vec2<f32>,
    step: f32,
    radius: f32,
    offset: f32,
    sigma_texel: f32,
    sigma_color: f32,
    _pad: f32,
};

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var linear_sampler: sampler;
@group(0) @binding(2) var input_frame: texture_2d<f32>;
@group(0) @binding(3) var segmentation_mask: texture_2d<f32>;

fn gaussian(x: f32, sigma: f32) -> f32 {
    return exp(-0.5 * x * x / (sigma * sigma));
}

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    let center = textureSampleLevel(input_frame, linear_sampler, in.uv, 0.0).rgb;

    var new_value = 0.0;
    var total_weight = 0.0;

    for (var i = -params.radius + params.offset; i <= params.radius; i += params.step) {
        for (var j = -params.radius + params.offset; j <= params.radius; j += params.step) {
            let shift = vec2<f32>(j, i) * params.texel_size;
            let coord = in.uv + shift;
            let frame_color = textureSampleLevel(input_frame, linear_sampler, coord, 0.0).rgb;
            let value = textureSampleLevel(segmentation_mask, linear_sampler, coord, 0.0).r;

            let weight = gaussian(length(shift), params.sigma_texel)
                * gaussian(distance(center, frame_color), params.sigma_color);
            total_weight += weight;
            new_value += weight * value;
        }
    }

    return vec4<f32>(new_value / total_weight, 0.0, 0.0, 1.0);
}
"#;

/// Filter parameters, derived from the ratio between output and
/// segmentation resolution.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BilateralParams {
    pub texel_size: [f32; 2],
    pub step: f32,
    pub radius: f32,
    pub offset: f32,
    pub sigma_texel: f32,
    pub sigma_color: f32,
    _pad: f32,
}

impl BilateralParams {
    pub fn derive(
        output: (u32, u32),
        segmentation: SegmentationDims,
        sigma_space: f32,
        sigma_color: f32,
    ) -> Self {
        let (width, height) = (output.0 as f32, output.1 as f32);
        let scale = (width / segmentation.width as f32).max(height / segmentation.height as f32);
        let sigma_space = sigma_space * scale;

        let step = (sigma_space.sqrt() * 0.66).max(1.0);
        let offset = if step > 1.0 { step * 0.5 } else { 0.0 };

        Self {
            texel_size: [1.0 / width, 1.0 / height],
            step,
            radius: sigma_space,
            offset,
            sigma_texel: (1.0 / width).max(1.0 / height) * sigma_space,
            sigma_color,
            _pad: 0.0,
        }
    }
}

/// Refines the upscaled segmentation into the person mask, keeping edges
/// where the frame has colour edges.
pub(crate) struct JointBilateralFilterStage {
    pass: FullscreenPass,
    uniforms: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl JointBilateralFilterStage {
    pub fn new(gpu: &GpuContext, textures: &FrameTextures, params: BilateralParams) -> Self {
        tracing::debug!("Joint bilateral filter: {:?}", params);

        let pass = FullscreenPass::new(
            gpu,
            "joint bilateral filter",
            BILATERAL_SHADER,
            wgpu::TextureFormat::R8Unorm,
        );
        let uniforms = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("joint bilateral filter params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let bind_group = pass.bind(
            gpu,
            &[
                uniforms.as_entire_binding(),
                wgpu::BindingResource::Sampler(&gpu.sampler),
                wgpu::BindingResource::TextureView(&textures.input.view),
                wgpu::BindingResource::TextureView(&textures.segmentation.view),
            ],
        );

        Self {
            pass,
            uniforms,
            bind_group,
        }
    }
}

impl GpuStage for JointBilateralFilterStage {
    fn name(&self) -> &'static str {
        "joint bilateral filter"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
        let mut encoder = ctx.gpu.encoder("joint bilateral filter");
        let target = &ctx.textures.person_mask.view;
        self.pass.draw(&mut encoder, &self.bind_group, target);
        ctx.gpu.submit(encoder);
        Ok(StageOutcome::Continue)
    }

    fn release(&mut self) {
        self.uniforms.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian(x: f32, sigma: f32) -> f32 {
        (-0.5 * x * x / (sigma * sigma)).exp()
    }

    /// Mirror of the fragment shader with nearest sampling
    fn filter_pixel(
        params: &BilateralParams,
        uv: [f32; 2],
        frame: impl Fn([f32; 2]) -> [f32; 3],
        mask: impl Fn([f32; 2]) -> f32,
    ) -> (f32, f32, f32) {
        let center = frame(uv);
        let (mut value, mut total) = (0.0, 0.0);
        let (mut lo, mut hi) = (f32::MAX, f32::MIN);

        let mut i = -params.radius + params.offset;
        while i <= params.radius {
            let mut j = -params.radius + params.offset;
            while j <= params.radius {
                let shift = [j * params.texel_size[0], i * params.texel_size[1]];
                let coord = [uv[0] + shift[0], uv[1] + shift[1]];
                let color = frame(coord);
                let m = mask(coord);
                let distance = ((center[0] - color[0]).powi(2)
                    + (center[1] - color[1]).powi(2)
                    + (center[2] - color[2]).powi(2))
                .sqrt();
                let weight = gaussian(shift[0].hypot(shift[1]), params.sigma_texel)
                    * gaussian(distance, params.sigma_color);
                total += weight;
                value += weight * m;
                lo = lo.min(m);
                hi = hi.max(m);
                j += params.step;
            }
            i += params.step;
        }

        (value / total, lo, hi)
    }

    #[test]
    fn parameters_follow_resolution_ratio() {
        let params =
            BilateralParams::derive((1280, 720), SegmentationDims::new(256, 144), 1.0, 0.1);

        assert_eq!(params.radius, 5.0);
        assert!((params.step - 5f32.sqrt() * 0.66).abs() < 1e-6);
        assert!((params.offset - params.step * 0.5).abs() < 1e-6);
        assert!((params.sigma_texel - 5.0 / 720.0).abs() < 1e-6);
        assert_eq!(params.texel_size, [1.0 / 1280.0, 1.0 / 720.0]);
        assert_eq!(params.sigma_color, 0.1);
    }

    #[test]
    fn equal_resolutions_sample_every_texel() {
        let params = BilateralParams::derive((256, 144), SegmentationDims::new(256, 144), 1.0, 0.1);

        assert_eq!(params.radius, 1.0);
        assert_eq!(params.step, 1.0);
        assert_eq!(params.offset, 0.0);
    }

    #[test]
    fn taller_ratio_wins() {
        let params =
            BilateralParams::derive((1920, 1080), SegmentationDims::new(160, 72), 2.0, 0.1);
        // 1080 / 72 = 15 beats 1920 / 160 = 12
        assert_eq!(params.radius, 30.0);
    }

    #[test]
    fn uniform_block_is_std140_sized() {
        assert_eq!(std::mem::size_of::<BilateralParams>(), 32);
    }

    #[test]
    fn filtered_value_stays_within_sampled_neighbourhood() {
        let params = BilateralParams::derive((64, 36), SegmentationDims::new(16, 9), 1.0, 0.1);
        let frame = |uv: [f32; 2]| {
            if uv[0] < 0.5 {
                [1.0, 1.0, 1.0]
            } else {
                [0.0, 0.0, 0.2]
            }
        };
        let mask = |uv: [f32; 2]| (uv[0] * 1.3 - 0.1).clamp(0.0, 1.0);

        for x in 0..64 {
            let uv = [(x as f32 + 0.5) / 64.0, 0.5];
            let (value, lo, hi) = filter_pixel(&params, uv, frame, mask);
            assert!((0.0..=1.0).contains(&value));
            assert!(value >= lo - 1e-5 && value <= hi + 1e-5, "x={} value={}", x, value);
        }
    }

    #[test]
    fn colour_edges_keep_the_mask_from_bleeding() {
        let params = BilateralParams::derive((64, 36), SegmentationDims::new(16, 9), 1.0, 0.1);
        // Mask and frame share the same edge
        let frame = |uv: [f32; 2]| if uv[0] < 0.5 { [1.0; 3] } else { [0.0; 3] };
        let mask = |uv: [f32; 2]| if uv[0] < 0.5 { 1.0 } else { 0.0 };

        let (inside, _, _) = filter_pixel(&params, [0.49, 0.5], frame, mask);
        let (outside, _, _) = filter_pixel(&params, [0.51, 0.5], frame, mask);

        assert!(inside > 0.99, "inside {}", inside);
        assert!(outside < 0.01, "outside {}", outside);
    }
}
