//! SIMD-accelerated Euclidean distance and the projection helpers used to
//! split a node.
//!
//! # Performance Strategy
//!
//! Uses 4-way accumulator unrolling to break FMA dependency chains. With
//! `f64` lanes an AVX2 register holds 4 coordinates and a NEON register 2,
//! so the main loops consume 16 and 8 coordinates per iteration.
//!
//! Every component (builder, search, linear scan) calls the same
//! [`euclidean_distance`], so distance comparisons across components are
//! bit-for-bit consistent on a given machine.

/// Compute L2 (Euclidean) distance between two vectors with SIMD acceleration.
///
/// # Architecture Dispatch
///
/// - x86_64 + AVX2 + FMA: AVX2 intrinsics (runtime detection)
/// - aarch64: NEON intrinsics (always available)
/// - Fallback: portable scalar implementation
#[inline]
#[must_use]
pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { euclidean_distance_avx2(a, b) };
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { euclidean_distance_neon(a, b) };
    }

    euclidean_distance_scalar(a, b)
}

/// Scalar implementation (portable fallback)
#[inline]
#[must_use]
pub fn euclidean_distance_scalar(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum::<f64>()
        .sqrt()
}

/// AVX2 implementation with 4-way accumulator unrolling (x86_64 only)
///
/// Main loop: 16 doubles/iteration (4 accumulators × 4 lanes)
/// Tail loop: remaining 4-double chunks
/// Scalar tail: final <4 elements
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn euclidean_distance_avx2(a: &[f64], b: &[f64]) -> f64 {
    use std::arch::x86_64::*;

    let len = a.len().min(b.len());
    let pa = a.as_ptr();
    let pb = b.as_ptr();
    let mut i = 0;

    let mut sum0 = _mm256_setzero_pd();
    let mut sum1 = _mm256_setzero_pd();
    let mut sum2 = _mm256_setzero_pd();
    let mut sum3 = _mm256_setzero_pd();

    while i + 16 <= len {
        let diff0 = unsafe { _mm256_sub_pd(_mm256_loadu_pd(pa.add(i)), _mm256_loadu_pd(pb.add(i))) };
        let diff1 = unsafe {
            _mm256_sub_pd(_mm256_loadu_pd(pa.add(i + 4)), _mm256_loadu_pd(pb.add(i + 4)))
        };
        let diff2 = unsafe {
            _mm256_sub_pd(_mm256_loadu_pd(pa.add(i + 8)), _mm256_loadu_pd(pb.add(i + 8)))
        };
        let diff3 = unsafe {
            _mm256_sub_pd(_mm256_loadu_pd(pa.add(i + 12)), _mm256_loadu_pd(pb.add(i + 12)))
        };

        sum0 = _mm256_fmadd_pd(diff0, diff0, sum0);
        sum1 = _mm256_fmadd_pd(diff1, diff1, sum1);
        sum2 = _mm256_fmadd_pd(diff2, diff2, sum2);
        sum3 = _mm256_fmadd_pd(diff3, diff3, sum3);

        i += 16;
    }

    while i + 4 <= len {
        let diff = unsafe { _mm256_sub_pd(_mm256_loadu_pd(pa.add(i)), _mm256_loadu_pd(pb.add(i))) };
        sum0 = _mm256_fmadd_pd(diff, diff, sum0);
        i += 4;
    }

    let combined = _mm256_add_pd(_mm256_add_pd(sum0, sum1), _mm256_add_pd(sum2, sum3));

    // 4 lanes -> 2 lanes -> 1 lane
    let high = _mm256_extractf128_pd(combined, 1);
    let low = _mm256_castpd256_pd128(combined);
    let pair = _mm_add_pd(low, high);
    let single = _mm_add_sd(pair, _mm_unpackhi_pd(pair, pair));

    let mut total = _mm_cvtsd_f64(single);

    while i < len {
        let diff = unsafe { *pa.add(i) - *pb.add(i) };
        total += diff * diff;
        i += 1;
    }

    total.sqrt()
}

/// NEON implementation with 4-way accumulator unrolling (aarch64)
#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn euclidean_distance_neon(a: &[f64], b: &[f64]) -> f64 {
    use std::arch::aarch64::*;

    let len = a.len().min(b.len());
    let pa = a.as_ptr();
    let pb = b.as_ptr();
    let mut i = 0;

    let mut sum0 = vdupq_n_f64(0.0);
    let mut sum1 = vdupq_n_f64(0.0);
    let mut sum2 = vdupq_n_f64(0.0);
    let mut sum3 = vdupq_n_f64(0.0);

    while i + 8 <= len {
        let diff0 = unsafe { vsubq_f64(vld1q_f64(pa.add(i)), vld1q_f64(pb.add(i))) };
        let diff1 = unsafe { vsubq_f64(vld1q_f64(pa.add(i + 2)), vld1q_f64(pb.add(i + 2))) };
        let diff2 = unsafe { vsubq_f64(vld1q_f64(pa.add(i + 4)), vld1q_f64(pb.add(i + 4))) };
        let diff3 = unsafe { vsubq_f64(vld1q_f64(pa.add(i + 6)), vld1q_f64(pb.add(i + 6))) };

        sum0 = vfmaq_f64(sum0, diff0, diff0);
        sum1 = vfmaq_f64(sum1, diff1, diff1);
        sum2 = vfmaq_f64(sum2, diff2, diff2);
        sum3 = vfmaq_f64(sum3, diff3, diff3);

        i += 8;
    }

    while i + 2 <= len {
        let diff = unsafe { vsubq_f64(vld1q_f64(pa.add(i)), vld1q_f64(pb.add(i))) };
        sum0 = vfmaq_f64(sum0, diff, diff);
        i += 2;
    }

    let combined = vaddq_f64(vaddq_f64(sum0, sum1), vaddq_f64(sum2, sum3));
    let mut total = vaddvq_f64(combined);

    while i < len {
        let diff = unsafe { *pa.add(i) - *pb.add(i) };
        total += diff * diff;
        i += 1;
    }

    total.sqrt()
}

/// Dot product of two vectors.
#[inline]
#[must_use]
pub fn dot_product(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Coordinate sum of the projection of `v` onto `baseline`.
///
/// The projection is `baseline * (v·baseline / baseline·baseline)`; its
/// coordinates are summed one by one so the key of a candidate and the key
/// of the split median are computed by the same rule.
#[inline]
#[must_use]
pub fn projection_key(v: &[f64], baseline: &[f64], baseline_norm_sq: f64) -> f64 {
    let scale = dot_product(v, baseline) / baseline_norm_sq;
    baseline.iter().map(|b| b * scale).sum()
}
