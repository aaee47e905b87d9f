//! Unscaled type-II DCT using Byeong Gi Lee's recursive factorization.
//!
//! Output matches the textbook `X[k] = sum(x[n] * cos(pi/N * (n + 0.5) * k))`
//! without normalization, up to floating point rounding. The evaluation order
//! is fixed so results are reproducible bit-for-bit.

use std::f64::consts::PI;

/// Transform `vector` in place. The length must be a power of two.
pub fn transform(vector: &mut [f64]) {
    let len = vector.len();
    debug_assert!(len.is_power_of_two(), "DCT length must be a power of two");
    let mut temp = vec![0.0; len];
    forward(vector, &mut temp);
}

fn forward(vector: &mut [f64], temp: &mut [f64]) {
    let len = vector.len();
    if len == 1 {
        return;
    }

    let half = len / 2;
    for i in 0..half {
        let x = vector[i];
        let y = vector[len - 1 - i];
        temp[i] = x + y;
        temp[i + half] = (x - y) / (((i as f64 + 0.5) * PI / len as f64).cos() * 2.0);
    }

    let (lo, hi) = temp.split_at_mut(half);
    forward(lo, &mut vector[..half]);
    forward(hi, &mut vector[..half]);

    for i in 0..half - 1 {
        vector[i * 2] = temp[i];
        vector[i * 2 + 1] = temp[i + half] + temp[i + half + 1];
    }
    vector[len - 2] = temp[half - 1];
    vector[len - 1] = temp[len - 1];
}
