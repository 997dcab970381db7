//! Sliding-window inference for full-volume validation.
//!
//! Validation volumes are larger than the training patch, so the model is
//! applied over a grid of patch-sized windows whose stride is set by the
//! configured overlap fraction. Overlapping logits are averaged.

use candle_core::{Result, Tensor};

use crate::model::SegModel;

/// Window origins along one axis: stride `window * (1 - overlap)`, with a
/// final window clamped so the axis is fully covered.
fn window_origins(dim: usize, window: usize, overlap: f64) -> Vec<usize> {
    if window >= dim {
        return vec![0];
    }
    let stride = ((window as f64 * (1.0 - overlap)).round() as usize).max(1);
    let mut origins = Vec::new();
    let mut start = 0;
    loop {
        if start + window >= dim {
            origins.push(dim - window);
            break;
        }
        origins.push(start);
        start += stride;
    }
    origins
}

/// Run sliding-window inference over `image` (`[b, c, d, h, w]`), returning
/// averaged prediction logits `[b, classes, d, h, w]`.
pub fn sliding_window_inference(
    model: &dyn SegModel,
    image: &Tensor,
    patch_size: [usize; 3],
    overlap: f64,
    n_classes: usize,
) -> Result<Tensor> {
    let (b, _c, d, h, w) = image.dims5()?;
    let wd = patch_size[0].min(d);
    let wh = patch_size[1].min(h);
    let ww = patch_size[2].min(w);

    let mut sums = vec![0f32; b * n_classes * d * h * w];
    let mut counts = vec![0f32; d * h * w];

    for &od in &window_origins(d, wd, overlap) {
        for &oh in &window_origins(h, wh, overlap) {
            for &ow in &window_origins(w, ww, overlap) {
                let patch = image
                    .narrow(2, od, wd)?
                    .narrow(3, oh, wh)?
                    .narrow(4, ow, ww)?;
                let logits = model.forward(&patch)?.prediction;
                let values = logits.flatten_all()?.to_vec1::<f32>()?;

                for bi in 0..b {
                    for k in 0..n_classes {
                        for z in 0..wd {
                            for y in 0..wh {
                                for x in 0..ww {
                                    let src = (((bi * n_classes + k) * wd + z) * wh + y) * ww + x;
                                    let dst = (((bi * n_classes + k) * d + od + z) * h + oh + y)
                                        * w
                                        + ow
                                        + x;
                                    sums[dst] += values[src];
                                }
                            }
                        }
                    }
                }
                for z in 0..wd {
                    for y in 0..wh {
                        for x in 0..ww {
                            counts[((od + z) * h + oh + y) * w + ow + x] += 1.0;
                        }
                    }
                }
            }
        }
    }

    for bi in 0..b {
        for k in 0..n_classes {
            let base = (bi * n_classes + k) * d * h * w;
            for (i, &count) in counts.iter().enumerate() {
                sums[base + i] /= count.max(1.0);
            }
        }
    }

    Tensor::from_vec(sums, (b, n_classes, d, h, w), image.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelOutput;
    use candle_core::Device;

    /// Model whose prediction copies the first input channel into every
    /// class channel, so stitched output is directly comparable to input.
    struct EchoModel {
        n_classes: usize,
    }

    impl SegModel for EchoModel {
        fn forward(&self, image: &Tensor) -> Result<ModelOutput> {
            let channel = image.narrow(1, 0, 1)?;
            let parts: Vec<Tensor> = (0..self.n_classes).map(|_| channel.clone()).collect();
            let refs: Vec<&Tensor> = parts.iter().collect();
            Ok(ModelOutput {
                prediction: Tensor::cat(&refs, 1)?,
                deep_supervision: None,
                vae_reg: None,
            })
        }
    }

    #[test]
    fn test_window_origins_cover_axis() {
        let origins = window_origins(10, 4, 0.5);
        assert_eq!(origins.first(), Some(&0));
        assert_eq!(origins.last(), Some(&6), "last window must touch the end");
        for pair in origins.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_window_origins_degenerate_axis() {
        assert_eq!(window_origins(4, 8, 0.5), vec![0]);
        assert_eq!(window_origins(4, 4, 0.5), vec![0]);
    }

    #[test]
    fn test_sliding_window_reconstructs_echo() -> Result<()> {
        let device = Device::Cpu;
        let image = Tensor::rand(0f32, 1f32, (1, 1, 6, 6, 6), &device)?;
        let model = EchoModel { n_classes: 2 };

        let out = sliding_window_inference(&model, &image, [4, 4, 4], 0.5, 2)?;
        assert_eq!(out.dims(), &[1, 2, 6, 6, 6]);

        // Averaging identical windowed copies must reproduce the input.
        let expected = image.flatten_all()?.to_vec1::<f32>()?;
        let got = out.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        for (e, g) in expected.iter().zip(got.iter()) {
            assert!((e - g).abs() < 1e-5, "stitched {} != original {}", g, e);
        }
        Ok(())
    }

    #[test]
    fn test_sliding_window_patch_equals_volume() -> Result<()> {
        let device = Device::Cpu;
        let image = Tensor::rand(0f32, 1f32, (1, 1, 4, 4, 4), &device)?;
        let model = EchoModel { n_classes: 1 };
        let out = sliding_window_inference(&model, &image, [4, 4, 4], 0.25, 1)?;
        let expected = image.flatten_all()?.to_vec1::<f32>()?;
        let got = out.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(expected.len(), got.len());
        for (e, g) in expected.iter().zip(got.iter()) {
            assert!((e - g).abs() < 1e-6);
        }
        Ok(())
    }
}
