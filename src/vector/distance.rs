//! Distance kernels over raw element slices
//!
//! f32 kernels pick an AVX2 path when the CPU supports it (detected once),
//! otherwise SSE or scalar. Callers guarantee equal lengths.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;
#[cfg(target_arch = "x86_64")]
use std::sync::OnceLock;

#[cfg(target_arch = "x86_64")]
static CPU_FEATURES: OnceLock<CpuFeatures> = OnceLock::new();

#[cfg(target_arch = "x86_64")]
#[derive(Clone, Copy)]
struct CpuFeatures {
    has_avx2_fma: bool,
    has_sse: bool,
}

#[cfg(target_arch = "x86_64")]
fn cpu_features() -> CpuFeatures {
    *CPU_FEATURES.get_or_init(|| CpuFeatures {
        has_avx2_fma: is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma"),
        has_sse: is_x86_feature_detected!("sse"),
    })
}

/// Squared Euclidean distance
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    {
        let features = cpu_features();
        if features.has_avx2_fma && a.len() >= 8 {
            // SAFETY: avx2 + fma detected at runtime
            unsafe { l2_squared_avx2(a, b) }
        } else if features.has_sse && a.len() >= 4 {
            // SAFETY: sse detected at runtime
            unsafe { l2_squared_sse(a, b) }
        } else {
            l2_squared_scalar(a, b)
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        l2_squared_scalar(a, b)
    }
}

/// Dot product
#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if cpu_features().has_avx2_fma && a.len() >= 8 {
            // SAFETY: avx2 + fma detected at runtime
            unsafe { inner_product_avx2(a, b) }
        } else {
            inner_product_scalar(a, b)
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        inner_product_scalar(a, b)
    }
}

/// Manhattan distance
pub fn l1(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
}

/// 1 - cos(a, b), clamped to [0, 2]; NaN if either vector has zero norm
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot = inner_product(a, b);
    let norms = (inner_product(a, a) * inner_product(b, b)).sqrt();
    if norms == 0.0 {
        return f32::NAN;
    }
    1.0 - (dot / norms).clamp(-1.0, 1.0)
}

/// Number of differing bits
pub fn hamming(a: &[u8], b: &[u8]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum::<u32>() as f32
}

/// 1 - |a ∩ b| / |a ∪ b|; 1.0 when the intersection is empty
pub fn jaccard(a: &[u8], b: &[u8]) -> f32 {
    let (mut both, mut count_a, mut count_b) = (0u32, 0u32, 0u32);
    for (x, y) in a.iter().zip(b) {
        both += (x & y).count_ones();
        count_a += x.count_ones();
        count_b += y.count_ones();
    }
    if both == 0 {
        return 1.0;
    }
    1.0 - both as f32 / (count_a + count_b - both) as f32
}

fn l2_squared_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn inner_product_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn l2_squared_avx2(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let chunks = n / 8;

    let mut sum = _mm256_setzero_ps();
    for i in 0..chunks {
        let offset = i * 8;
        let va = _mm256_loadu_ps(a.as_ptr().add(offset));
        let vb = _mm256_loadu_ps(b.as_ptr().add(offset));
        let diff = _mm256_sub_ps(va, vb);
        sum = _mm256_fmadd_ps(diff, diff, sum);
    }

    let mut total = horizontal_sum_avx2(sum);
    for i in chunks * 8..n {
        let diff = a[i] - b[i];
        total += diff * diff;
    }
    total
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn inner_product_avx2(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let chunks = n / 8;

    let mut sum = _mm256_setzero_ps();
    for i in 0..chunks {
        let offset = i * 8;
        let va = _mm256_loadu_ps(a.as_ptr().add(offset));
        let vb = _mm256_loadu_ps(b.as_ptr().add(offset));
        sum = _mm256_fmadd_ps(va, vb, sum);
    }

    let mut total = horizontal_sum_avx2(sum);
    for i in chunks * 8..n {
        total += a[i] * b[i];
    }
    total
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse")]
unsafe fn l2_squared_sse(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let chunks = n / 4;

    let mut sum = _mm_setzero_ps();
    for i in 0..chunks {
        let offset = i * 4;
        let va = _mm_loadu_ps(a.as_ptr().add(offset));
        let vb = _mm_loadu_ps(b.as_ptr().add(offset));
        let diff = _mm_sub_ps(va, vb);
        sum = _mm_add_ps(sum, _mm_mul_ps(diff, diff));
    }

    // 水平求和
    let pair = _mm_add_ps(sum, _mm_movehl_ps(sum, sum));
    let single = _mm_add_ss(pair, _mm_shuffle_ps(pair, pair, 1));
    let mut total = _mm_cvtss_f32(single);

    for i in chunks * 4..n {
        let diff = a[i] - b[i];
        total += diff * diff;
    }
    total
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn horizontal_sum_avx2(v: __m256) -> f32 {
    let high = _mm256_extractf128_ps(v, 1);
    let low = _mm256_castps256_ps128(v);
    let sum128 = _mm_add_ps(high, low);

    let shuf = _mm_movehdup_ps(sum128);
    let sum64 = _mm_add_ps(sum128, shuf);
    let shuf2 = _mm_movehl_ps(shuf, sum64);
    let sum32 = _mm_add_ss(sum64, shuf2);

    _mm_cvtss_f32(sum32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_squared() {
        assert_eq!(l2_squared(&[0.0, 0.0], &[3.0, 4.0]), 25.0);

        // SIMD 路径与标量结果一致
        let a: Vec<f32> = (0..37).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..37).map(|i| (37 - i) as f32 * 0.25).collect();
        let expected = l2_squared_scalar(&a, &b);
        assert!((l2_squared(&a, &b) - expected).abs() / expected < 1e-5);
        assert!((l2_squared(&a[..5], &b[..5]) - l2_squared_scalar(&a[..5], &b[..5])).abs() < 1e-4);
    }

    #[test]
    fn test_inner_product() {
        let a: Vec<f32> = (0..19).map(|i| i as f32).collect();
        let expected: f32 = a.iter().map(|x| x * x).sum();
        assert!((inner_product(&a, &a) - expected).abs() < 1e-3);
    }

    #[test]
    fn test_l1() {
        assert_eq!(l1(&[1.0, -2.0, 3.0], &[0.0, 2.0, 3.0]), 5.0);
    }

    #[test]
    fn test_cosine() {
        assert!(cosine(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-6);
        assert!((cosine(&[1.0, 0.0], &[0.0, 3.0]) - 1.0).abs() < 1e-6);
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert!(cosine(&[0.0, 0.0], &[1.0, 0.0]).is_nan());
    }

    #[test]
    fn test_bit_distances() {
        assert_eq!(hamming(&[0b1010_0000], &[0b0110_0000]), 2.0);
        assert_eq!(jaccard(&[0b1100_0000], &[0b1000_0000]), 0.5);
        assert_eq!(jaccard(&[0], &[0]), 1.0);
    }
}
