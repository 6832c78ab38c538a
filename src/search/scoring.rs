//! Relevance scoring: log-scaled term frequency, IDF and a recency decay.

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Inverse document frequency, always positive.
pub fn idf(doc_freq: usize, total_docs: usize) -> f32 {
    let n = total_docs as f64;
    let df = doc_freq as f64;
    (1.0 + (n - df + 0.5) / (df + 0.5)).ln() as f32
}

/// Sublinear term-frequency weight.
pub fn tf_weight(tf: u32) -> f32 {
    if tf == 0 {
        0.0
    } else {
        1.0 + (tf as f32).ln()
    }
}

/// Halves every `half_life_days`, never below `floor`.
pub fn recency_weight(age_ms: i64, half_life_days: f64, floor: f32) -> f32 {
    let age_days = age_ms.max(0) as f64 / MILLIS_PER_DAY;
    let weight = 0.5f64.powf(age_days / half_life_days) as f32;
    weight.max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idf_rewards_rare_terms() {
        assert!(idf(1, 100) > idf(50, 100));
        assert!(idf(100, 100) > 0.0);
    }

    #[test]
    fn test_tf_weight_is_sublinear() {
        assert_eq!(tf_weight(0), 0.0);
        assert_eq!(tf_weight(1), 1.0);
        assert!(tf_weight(10) < 10.0);
        assert!(tf_weight(10) > tf_weight(2));
    }

    #[test]
    fn test_recency_weight() {
        let day = MILLIS_PER_DAY as i64;
        assert_eq!(recency_weight(0, 30.0, 0.05), 1.0);
        assert!((recency_weight(30 * day, 30.0, 0.05) - 0.5).abs() < 1e-6);
        assert_eq!(recency_weight(3650 * day, 30.0, 0.05), 0.05);
        assert_eq!(recency_weight(-5, 30.0, 0.05), 1.0);
    }
}
