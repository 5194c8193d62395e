//! Per-seed latent noise streams.

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Spatial downscale factor between pixel space and latent space.
pub const LATENT_FACTOR: usize = 8;

/// Deterministic noise source for one batch of images.
///
/// Each image draws from its own generator stream seeded by its seed, so a
/// batch of size one with seed `s` produces the same noise as image `i` of
/// any batch whose `seeds[i] == s`. The first [`next`](ImageRng::next) call
/// yields the initial latent noise (with subseed blending and seed-resize
/// pasting applied); later calls continue the raw per-seed streams for
/// samplers that need extra noise mid-run.
pub struct ImageRng<B: Backend> {
    shape: [usize; 3],
    seeds: Vec<i64>,
    subseeds: Vec<i64>,
    subseed_strength: f64,
    seed_resize_from_w: u32,
    seed_resize_from_h: u32,
    streams: Vec<StdRng>,
    first_draw: bool,
    device: B::Device,
}

impl<B: Backend> ImageRng<B> {
    /// Creates a generator for per-image latent `shape`
    /// `[channels, height, width]`, one stream per entry of `seeds`.
    pub fn new(shape: [usize; 3], seeds: &[i64], device: &B::Device) -> Self {
        let streams = seeds
            .iter()
            .map(|&seed| StdRng::seed_from_u64(seed as u64))
            .collect();
        Self {
            shape,
            seeds: seeds.to_vec(),
            subseeds: Vec::new(),
            subseed_strength: 0.0,
            seed_resize_from_w: 0,
            seed_resize_from_h: 0,
            streams,
            first_draw: true,
            device: device.clone(),
        }
    }

    /// Enables variation-seed blending at the given strength in `[0, 1]`.
    pub fn with_subseeds(mut self, subseeds: &[i64], strength: f64) -> Self {
        self.subseeds = subseeds.to_vec();
        self.subseed_strength = strength;
        self
    }

    /// Keeps noise structure from an earlier generation at `from_w` x
    /// `from_h` pixels by drawing at that latent size and pasting the
    /// result centered into full-size noise from the same seed.
    pub fn with_seed_resize(mut self, from_w: u32, from_h: u32) -> Self {
        self.seed_resize_from_w = from_w;
        self.seed_resize_from_h = from_h;
        self
    }

    /// Next noise tensor of shape `[batch, channels, height, width]`.
    pub fn next(&mut self) -> Tensor<B, 4> {
        if self.first_draw {
            self.first_draw = false;
            return self.first();
        }
        let per_image = self.shape[0] * self.shape[1] * self.shape[2];
        let mut flat = Vec::with_capacity(self.seeds.len() * per_image);
        for stream in &mut self.streams {
            for _ in 0..per_image {
                flat.push(stream.sample::<f32, _>(StandardNormal));
            }
        }
        self.assemble(flat)
    }

    fn first(&mut self) -> Tensor<B, 4> {
        let [channels, height, width] = self.shape;
        let per_image = channels * height * width;
        let noise_shape = if self.seed_resize_from_w == 0 || self.seed_resize_from_h == 0 {
            self.shape
        } else {
            [
                channels,
                self.seed_resize_from_h as usize / LATENT_FACTOR,
                self.seed_resize_from_w as usize / LATENT_FACTOR,
            ]
        };

        let mut flat = Vec::with_capacity(self.seeds.len() * per_image);
        for (i, &seed) in self.seeds.iter().enumerate() {
            // The target-shape draw comes out of the per-seed stream so a
            // later `next` continues it rather than replaying it.
            let stream = &mut self.streams[i];
            let mut full: Vec<f32> = (0..per_image)
                .map(|_| stream.sample::<f32, _>(StandardNormal))
                .collect();

            let subseed = if self.subseed_strength != 0.0 && !self.subseeds.is_empty() {
                Some(self.subseeds.get(i).copied().unwrap_or(0))
            } else {
                None
            };

            if noise_shape == self.shape {
                if let Some(subseed) = subseed {
                    blend_subnoise(&mut full, subseed, self.subseed_strength, noise_shape);
                }
            } else {
                let mut noise = randn_vec(seed as u64, noise_shape);
                if let Some(subseed) = subseed {
                    blend_subnoise(&mut noise, subseed, self.subseed_strength, noise_shape);
                }
                paste_center(&mut full, self.shape, &noise, noise_shape);
            }
            flat.extend_from_slice(&full);
        }
        self.assemble(flat)
    }

    fn assemble(&self, flat: Vec<f32>) -> Tensor<B, 4> {
        let [channels, height, width] = self.shape;
        let data = TensorData::new(flat, [self.seeds.len(), channels, height, width]);
        Tensor::from_data(data, &self.device)
    }
}

/// Mixes variation noise into `noise` by linear interpolation.
fn blend_subnoise(noise: &mut [f32], subseed: i64, strength: f64, shape: [usize; 3]) {
    let subnoise = randn_vec(subseed as u64, shape);
    let t = strength as f32;
    for (base, sub) in noise.iter_mut().zip(subnoise.iter()) {
        *base = *base * (1.0 - t) + *sub * t;
    }
}

/// Standard-normal draw of `shape` from a generator freshly seeded with
/// `seed`. Restarting per call is what makes the seed-resize paths agree on
/// the values a given seed produces at a given shape.
fn randn_vec(seed: u64, shape: [usize; 3]) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..shape[0] * shape[1] * shape[2])
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect()
}

/// Pastes `src` centered into `dst`, cropping whichever is larger. Uses
/// floor division so odd size differences land on a fixed side.
fn paste_center(dst: &mut [f32], dst_shape: [usize; 3], src: &[f32], src_shape: [usize; 3]) {
    let [channels, dst_h, dst_w] = dst_shape;
    let [_, src_h, src_w] = src_shape;

    let dx = (dst_w as isize - src_w as isize).div_euclid(2);
    let dy = (dst_h as isize - src_h as isize).div_euclid(2);
    let w = if dx >= 0 {
        src_w as isize
    } else {
        src_w as isize + 2 * dx
    };
    let h = if dy >= 0 {
        src_h as isize
    } else {
        src_h as isize + 2 * dy
    };
    if w <= 0 || h <= 0 {
        return;
    }
    let (w, h) = (w as usize, h as usize);
    let (tx, ty) = (dx.max(0) as usize, dy.max(0) as usize);
    let (sx, sy) = ((-dx).max(0) as usize, (-dy).max(0) as usize);

    for c in 0..channels {
        for row in 0..h {
            let d0 = c * dst_h * dst_w + (ty + row) * dst_w + tx;
            let s0 = c * src_h * src_w + (sy + row) * src_w + sx;
            dst[d0..d0 + w].copy_from_slice(&src[s0..s0 + w]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn device() -> <TestBackend as Backend>::Device {
        Default::default()
    }

    fn draw(rng: &mut ImageRng<TestBackend>) -> Vec<f32> {
        rng.next().into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn identical_parameters_give_identical_noise() {
        let device = device();
        let mut a = ImageRng::new([4, 8, 8], &[42, 43], &device);
        let mut b = ImageRng::new([4, 8, 8], &[42, 43], &device);
        assert_eq!(draw(&mut a), draw(&mut b));
    }

    #[test]
    fn distinct_seeds_give_distinct_noise() {
        let device = device();
        let mut a = ImageRng::new([4, 8, 8], &[42], &device);
        let mut b = ImageRng::new([4, 8, 8], &[43], &device);
        assert_ne!(draw(&mut a), draw(&mut b));
    }

    #[test]
    fn batch_noise_matches_single_image_noise() {
        let device = device();
        let mut batch = ImageRng::new([4, 8, 8], &[42, 43], &device);
        let mut single = ImageRng::new([4, 8, 8], &[43], &device);
        let batch_noise = draw(&mut batch);
        assert_eq!(batch_noise[4 * 8 * 8..], draw(&mut single)[..]);
    }

    #[test]
    fn zero_strength_ignores_subseeds() {
        let device = device();
        let mut plain = ImageRng::new([4, 8, 8], &[42], &device);
        let mut with_sub = ImageRng::new([4, 8, 8], &[42], &device).with_subseeds(&[777], 0.0);
        assert_eq!(draw(&mut plain), draw(&mut with_sub));
    }

    #[test]
    fn full_strength_reproduces_subseed_noise() {
        let device = device();
        let mut blended = ImageRng::new([4, 8, 8], &[42], &device).with_subseeds(&[777], 1.0);
        let mut pure_sub = ImageRng::new([4, 8, 8], &[777], &device);
        assert_eq!(draw(&mut blended), draw(&mut pure_sub));
    }

    #[test]
    fn half_strength_blends_linearly() {
        let device = device();
        let mut base = ImageRng::new([1, 4, 4], &[42], &device);
        let mut sub = ImageRng::new([1, 4, 4], &[777], &device);
        let mut blended = ImageRng::new([1, 4, 4], &[42], &device).with_subseeds(&[777], 0.5);

        let (a, b, mixed) = (draw(&mut base), draw(&mut sub), draw(&mut blended));
        for i in 0..a.len() {
            let expected = a[i] * 0.5 + b[i] * 0.5;
            assert!((mixed[i] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn seed_resize_preserves_center_block() {
        let device = device();
        // 32x32 pixels is a 4x4 latent pasted into the 8x8 target.
        let mut resized = ImageRng::new([1, 8, 8], &[42], &device).with_seed_resize(32, 32);
        let mut small = ImageRng::new([1, 4, 4], &[42], &device);
        let mut full = ImageRng::new([1, 8, 8], &[42], &device);

        let out = draw(&mut resized);
        let small_noise = draw(&mut small);
        let full_noise = draw(&mut full);

        for row in 0..4 {
            for col in 0..4 {
                let center = out[(row + 2) * 8 + col + 2];
                assert_eq!(center, small_noise[row * 4 + col]);
            }
        }
        // Outside the pasted block the full-resolution stream shows through.
        assert_eq!(out[0], full_noise[0]);
        assert_eq!(out[63], full_noise[63]);
    }

    #[test]
    fn later_draws_continue_the_stream() {
        let device = device();
        let mut a = ImageRng::new([4, 8, 8], &[42], &device);
        let mut b = ImageRng::new([4, 8, 8], &[42], &device);

        let first_a = draw(&mut a);
        let second_a = draw(&mut a);
        assert_ne!(first_a, second_a);

        draw(&mut b);
        assert_eq!(second_a, draw(&mut b));
    }
}
