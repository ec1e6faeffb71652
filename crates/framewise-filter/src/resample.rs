//! Bicubic resampling for the chroma planes that bypass the model.

/// Catmull-Rom kernel (bicubic with a = -0.5).
fn cubic_weight(t: f32) -> f32 {
    const A: f32 = -0.5;
    let t = t.abs();
    if t <= 1.0 {
        (A + 2.0) * t * t * t - (A + 3.0) * t * t + 1.0
    } else if t < 2.0 {
        A * t * t * t - 5.0 * A * t * t + 8.0 * A * t - 4.0 * A
    } else {
        0.0
    }
}

/// Resize one 8-bit plane to `dst_width` x `dst_height`. The destination is
/// tightly packed (stride == width). Sampling is center-aligned with edge
/// clamping.
pub(crate) fn resize_bicubic(
    src: &[u8],
    src_width: usize,
    src_height: usize,
    src_stride: usize,
    dst_width: usize,
    dst_height: usize,
) -> Vec<u8> {
    if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
        return vec![0u8; dst_width * dst_height];
    }
    if src_width == dst_width && src_height == dst_height {
        let mut out = Vec::with_capacity(dst_width * dst_height);
        for row in 0..src_height {
            let start = row * src_stride;
            out.extend_from_slice(&src[start..start + src_width]);
        }
        return out;
    }

    let scale_x = src_width as f32 / dst_width as f32;
    let scale_y = src_height as f32 / dst_height as f32;
    let clamp_x = src_width - 1;
    let clamp_y = src_height - 1;
    let mut out = vec![0u8; dst_width * dst_height];

    for dy in 0..dst_height {
        let fy = (dy as f32 + 0.5) * scale_y - 0.5;
        let iy = fy.floor();
        let ty = fy - iy;
        let iy = iy as isize;
        for dx in 0..dst_width {
            let fx = (dx as f32 + 0.5) * scale_x - 0.5;
            let ix = fx.floor();
            let tx = fx - ix;
            let ix = ix as isize;

            let mut accum = 0.0f32;
            let mut weight_sum = 0.0f32;
            for ky in -1..=2isize {
                let wy = cubic_weight(ky as f32 - ty);
                if wy == 0.0 {
                    continue;
                }
                let sy = (iy + ky).clamp(0, clamp_y as isize) as usize;
                for kx in -1..=2isize {
                    let wx = cubic_weight(kx as f32 - tx);
                    if wx == 0.0 {
                        continue;
                    }
                    let sx = (ix + kx).clamp(0, clamp_x as isize) as usize;
                    let weight = wy * wx;
                    accum += weight * f32::from(src[sy * src_stride + sx]);
                    weight_sum += weight;
                }
            }
            let value = if weight_sum > 0.0 { accum / weight_sum } else { 0.0 };
            out[dy * dst_width + dx] = value.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_size_copies_rows_ignoring_stride_padding() {
        // 3x2 plane stored with stride 4.
        let src = [1u8, 2, 3, 99, 4, 5, 6, 99];
        let out = resize_bicubic(&src, 3, 2, 4, 3, 2);
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn constant_plane_stays_constant_at_any_scale() {
        let src = vec![128u8; 8 * 8];
        for (w, h) in [(16, 16), (4, 4), (5, 7)] {
            let out = resize_bicubic(&src, 8, 8, 8, w, h);
            assert_eq!(out.len(), w * h);
            assert!(out.iter().all(|&v| v == 128), "{w}x{h} drifted");
        }
    }

    #[test]
    fn upscale_preserves_a_horizontal_gradient_direction() {
        let src: Vec<u8> = (0..8).flat_map(|_| [0u8, 64, 128, 255]).collect();
        let out = resize_bicubic(&src, 4, 8, 4, 8, 8);
        for row in out.chunks(8) {
            for pair in row.windows(2) {
                assert!(pair[0] <= pair[1].saturating_add(8));
            }
        }
        assert!(out[0] < 32);
        assert!(out[7] > 224);
    }
}
