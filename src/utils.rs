use indicatif::ProgressStyle;

/// 单位向量允许的范数误差
pub const UNIT_NORM_TOLERANCE: f64 = 1e-5;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap()
        .progress_chars("#>-")
}

pub fn pb_style_speed() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] {pos} ({per_sec}) {msg}")
        .unwrap()
}

/// 计算向量的 L2 范数，使用 f64 累加以减小误差
pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|&x| x as f64 * x as f64).sum::<f64>().sqrt()
}

/// 原地归一化，范数为 0 或包含非有限值时返回 false，此时向量不变
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if !norm.is_finite() || norm < 1e-12 {
        return false;
    }
    for x in v.iter_mut() {
        *x = (*x as f64 / norm) as f32;
    }
    true
}

/// 向量是否为单位向量
pub fn is_unit(v: &[f32]) -> bool {
    (l2_norm(v) - 1.).abs() < UNIT_NORM_TOLERANCE
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
