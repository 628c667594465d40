use image::RgbaImage;

/// Porter-Duff operators used by the CPU compositor, on straight alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeOp {
    /// Replace the destination
    Copy,
    /// Keep the source where the destination is opaque
    SourceIn,
    /// Paint the source behind the destination
    DestinationOver,
}

/// Draw `src` onto `dst`. Both images must have the same dimensions.
pub fn draw(dst: &mut RgbaImage, src: &RgbaImage, op: CompositeOp) {
    debug_assert_eq!(dst.dimensions(), src.dimensions());

    if op == CompositeOp::Copy {
        dst.copy_from_slice(src.as_raw());
        return;
    }

    for (d, s) in dst.pixels_mut().zip(src.pixels()) {
        let sa = s[3] as f32 / 255.0;
        let da = d[3] as f32 / 255.0;

        match op {
            CompositeOp::SourceIn => {
                let alpha = sa * da;
                d.0 = [s[0], s[1], s[2], to_byte(alpha)];
            }
            CompositeOp::DestinationOver => {
                let behind = sa * (1.0 - da);
                let alpha = da + behind;
                if alpha <= 0.0 {
                    d.0 = [0, 0, 0, 0];
                    continue;
                }
                for c in 0..3 {
                    let value = (d[c] as f32 * da + s[c] as f32 * behind) / alpha;
                    d[c] = value.round().clamp(0.0, 255.0) as u8;
                }
                d[3] = to_byte(alpha);
            }
            CompositeOp::Copy => unreachable!(),
        }
    }
}

fn to_byte(alpha: f32) -> u8 {
    (alpha * 255.0).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn source_in_takes_destination_coverage() {
        let mut dst = RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 128]));
        let src = RgbaImage::from_pixel(1, 1, Rgba([200, 100, 50, 255]));
        draw(&mut dst, &src, CompositeOp::SourceIn);
        assert_eq!(dst.get_pixel(0, 0).0, [200, 100, 50, 128]);
    }

    #[test]
    fn destination_over_fills_uncovered_pixels() {
        let mut dst = RgbaImage::from_pixel(2, 1, Rgba([255, 255, 255, 0]));
        dst.put_pixel(1, 0, Rgba([255, 255, 255, 255]));
        let src = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 0, 255]));

        draw(&mut dst, &src, CompositeOp::DestinationOver);

        assert_eq!(dst.get_pixel(0, 0).0, [0, 0, 0, 255]);
        assert_eq!(dst.get_pixel(1, 0).0, [255, 255, 255, 255]);
    }

    #[test]
    fn destination_over_mixes_partial_coverage() {
        let mut dst = RgbaImage::from_pixel(1, 1, Rgba([200, 200, 200, 128]));
        let src = RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 255]));
        draw(&mut dst, &src, CompositeOp::DestinationOver);

        let pixel = dst.get_pixel(0, 0);
        assert_eq!(pixel[3], 255);
        assert!((pixel[0] as i32 - 100).abs() <= 1);
    }

    #[test]
    fn copy_replaces_everything() {
        let mut dst = RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 4]));
        let src = RgbaImage::from_pixel(2, 2, Rgba([9, 8, 7, 6]));
        draw(&mut dst, &src, CompositeOp::Copy);
        assert_eq!(dst, src);
    }
}
