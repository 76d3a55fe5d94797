// Scalar kernels behind the sample object types. Vectors of unequal length
// are compared as if the shorter one were padded with zeros.

pub fn euclidean_distance_scalar(a: &[f32], b: &[f32]) -> f32 {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let mut sum = 0.0;
    for i in 0..short.len() {
        sum += (short[i] - long[i]).powi(2);
    }
    for x in &long[short.len()..] {
        sum += x.powi(2);
    }
    sum
}

pub fn manhattan_distance_scalar(a: &[i16], b: &[i16]) -> i32 {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let mut sum: i32 = 0;
    for i in 0..short.len() {
        sum = sum.saturating_add((short[i] as i32 - long[i] as i32).abs());
    }
    for x in &long[short.len()..] {
        sum = sum.saturating_add((*x as i32).abs());
    }
    sum
}

/// Levenshtein distance over unicode scalar values, two-row dynamic program.
pub fn edit_distance(a: &str, b: &str) -> i32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return a.len().max(b.len()) as i32;
    }
    let mut prev: Vec<i32> = (0..=b.len() as i32).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i as i32 + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + i32::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
