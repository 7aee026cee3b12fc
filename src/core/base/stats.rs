use statrs::distribution::{Continuous, ContinuousCDF, Normal};

///////////
// Enums //
///////////

/// Alternative hypothesis of a Z-based test
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TestAlternative {
    /// Deviation in either direction
    TwoSided,
    /// Z above its expectation
    Greater,
    /// Z below its expectation
    Less,
}

///////////////
// Functions //
///////////////

/// Upper tail of the standard normal
///
/// Beyond `z = 6` the survival function underflows in double precision, so
/// the two-term Mills ratio expansion is used instead.
fn upper_tail(normal: &Normal, z: f64) -> f64 {
    match z {
        z if z > 6.0 => normal.pdf(z) * (1.0 / z - 1.0 / z.powi(3)),
        z => normal.sf(z),
    }
}

/// Transform a Z-score into a p-value (assuming normality)
///
/// ### Params
///
/// * `z` - The Z score.
/// * `alternative` - Which alternative hypothesis to test.
///
/// ### Returns
///
/// The p-value, clamped to `[0, 1]`. Non-finite Z scores give `1.0`.
pub fn z_score_to_pval(z: f64, alternative: TestAlternative) -> f64 {
    if !z.is_finite() {
        return 1.0;
    }
    // mean 0, sd 1 is always a valid parametrisation
    let normal = match Normal::new(0.0, 1.0) {
        Ok(n) => n,
        Err(_) => return 1.0,
    };
    let p = match alternative {
        TestAlternative::TwoSided => 2.0 * upper_tail(&normal, z.abs()),
        TestAlternative::Greater => upper_tail(&normal, z),
        TestAlternative::Less => upper_tail(&normal, -z),
    };
    p.clamp(0.0, 1.0)
}

/// Benjamini-Hochberg adjusted p-values
///
/// ### Params
///
/// * `pvals` - The raw p-values.
///
/// ### Returns
///
/// Adjusted p-values in input order, capped at 1.
pub fn calc_fdr(pvals: &[f64]) -> Vec<f64> {
    let n = pvals.len() as f64;
    let mut order: Vec<usize> = (0..pvals.len()).collect();
    order.sort_by(|&a, &b| pvals[a].total_cmp(&pvals[b]).then(a.cmp(&b)));

    let mut adjusted = vec![1.0; pvals.len()];
    let mut running = 1.0_f64;
    for (pos, &idx) in order.iter().enumerate().rev() {
        running = running.min(pvals[idx] * n / (pos + 1) as f64);
        adjusted[idx] = running;
    }
    adjusted
}

//////////////
// Wilcoxon //
//////////////

/// Result of a Wilcoxon rank-sum test
///
/// ### Fields
///
/// * `u` - Mann-Whitney U of the first group.
/// * `z` - Continuity corrected Z score.
/// * `p_value` - Two-sided p-value.
/// * `auc` - `U / (n1 * n2)`, the probability that a random observation of
///   the first group exceeds one of the second group.
#[derive(Clone, Debug, PartialEq)]
pub struct WilcoxonRes {
    pub u: f64,
    pub z: f64,
    pub p_value: f64,
    pub auc: f64,
}

/// Wilcoxon rank-sum test on sparse (zero-inflated) data
///
/// Only the non-zero values of each group are passed. The remaining
/// `n - nnz` entries of a group are exact zeros and are ranked as one tie
/// block below every positive value.
///
/// ### Params
///
/// * `nz_a` - Non-zero values of group a.
/// * `n_a` - Total size of group a (including zeros).
/// * `nz_b` - Non-zero values of group b.
/// * `n_b` - Total size of group b (including zeros).
///
/// ### Returns
///
/// The `WilcoxonRes` for group a vs group b. Degenerate inputs (an empty
/// group or all values tied) give `p = 1` and `auc = 0.5`.
pub fn wilcoxon_rank_sum_sparse(nz_a: &[f64], n_a: usize, nz_b: &[f64], n_b: usize) -> WilcoxonRes {
    let n1 = n_a as f64;
    let n2 = n_b as f64;
    let n = n1 + n2;

    if n_a == 0 || n_b == 0 {
        return WilcoxonRes {
            u: 0.0,
            z: 0.0,
            p_value: 1.0,
            auc: 0.5,
        };
    }

    let zeros_a = n_a.saturating_sub(nz_a.len());
    let zeros_b = n_b.saturating_sub(nz_b.len());
    let n_zero = zeros_a + zeros_b;

    // zero block
    let zero_rank = (n_zero as f64 + 1.0) / 2.0;
    let mut rank_sum_a = zeros_a as f64 * zero_rank;
    let mut tie_term = (n_zero as f64).powi(3) - n_zero as f64;

    // positive values: (value, in group a)
    let mut values: Vec<(f64, bool)> = nz_a
        .iter()
        .map(|&v| (v, true))
        .chain(nz_b.iter().map(|&v| (v, false)))
        .collect();
    values.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut i = 0;
    while i < values.len() {
        let start = i;
        while i < values.len() && values[i].0 == values[start].0 {
            i += 1;
        }
        let t = (i - start) as f64;
        let avg_rank = n_zero as f64 + (start + i + 1) as f64 / 2.0;
        let in_a = values[start..i].iter().filter(|(_, a)| *a).count() as f64;
        rank_sum_a += in_a * avg_rank;
        tie_term += t * t * t - t;
    }

    let u = rank_sum_a - n1 * (n1 + 1.0) / 2.0;
    let auc = u / (n1 * n2);
    let mean_u = n1 * n2 / 2.0;
    let var_u = n1 * n2 / 12.0 * ((n + 1.0) - tie_term / (n * (n - 1.0)));

    if var_u <= 0.0 {
        return WilcoxonRes {
            u,
            z: 0.0,
            p_value: 1.0,
            auc,
        };
    }

    let diff = u - mean_u;
    let correction = 0.5 * diff.signum();
    let z = (diff - correction) / var_u.sqrt();

    WilcoxonRes {
        u,
        z,
        p_value: z_score_to_pval(z, TestAlternative::TwoSided),
        auc,
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Dense average ranks, 1-based
    fn rank_vector(values: &[f64]) -> Vec<f64> {
        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        let mut ranks = vec![0.0; values.len()];
        let mut start = 0;
        for group in order.chunk_by(|&a, &b| values[a] == values[b]) {
            let avg = start as f64 + (group.len() as f64 + 1.0) / 2.0;
            for &idx in group {
                ranks[idx] = avg;
            }
            start += group.len();
        }
        ranks
    }

    #[test]
    fn test_fdr_matches_bh() {
        // p.adjust(c(0.01, 0.04, 0.03, 0.2), method = "BH")
        let fdr = calc_fdr(&[0.01, 0.04, 0.03, 0.2]);
        assert_relative_eq!(fdr[0], 0.04, epsilon = 1e-12);
        assert_relative_eq!(fdr[1], 0.04 * 4.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(fdr[2], 0.04 * 4.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(fdr[3], 0.2, epsilon = 1e-12);
        assert!(calc_fdr(&[]).is_empty());
    }

    #[test]
    fn test_rank_vector_ties() {
        let ranks = rank_vector(&[3.0, 1.0, 3.0, 2.0]);
        assert_eq!(ranks, vec![3.5, 1.0, 3.5, 2.0]);
    }

    #[test]
    fn test_z_to_pval() {
        assert_relative_eq!(
            z_score_to_pval(1.959963984540054, TestAlternative::TwoSided),
            0.05,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            z_score_to_pval(0.0, TestAlternative::Greater),
            0.5,
            epsilon = 1e-12
        );
        assert!(z_score_to_pval(40.0, TestAlternative::Greater) < 1e-300);
        assert_eq!(z_score_to_pval(f64::NAN, TestAlternative::TwoSided), 1.0);
    }

    #[test]
    fn test_wilcoxon_against_dense_ranking() {
        let a = [0.0, 0.0, 1.5, 2.0, 3.0, 3.0];
        let b = [0.0, 0.0, 0.0, 0.5, 1.5, 0.0, 0.2];

        let nz_a: Vec<f64> = a.iter().copied().filter(|&v| v != 0.0).collect();
        let nz_b: Vec<f64> = b.iter().copied().filter(|&v| v != 0.0).collect();
        let res = wilcoxon_rank_sum_sparse(&nz_a, a.len(), &nz_b, b.len());

        let all: Vec<f64> = a.iter().chain(b.iter()).copied().collect();
        let ranks = rank_vector(&all);
        let rank_sum: f64 = ranks[..a.len()].iter().sum();
        let expected_u = rank_sum - (a.len() * (a.len() + 1)) as f64 / 2.0;

        assert_relative_eq!(res.u, expected_u, epsilon = 1e-12);
        assert_relative_eq!(res.auc, expected_u / 42.0, epsilon = 1e-12);
        assert!(res.z > 0.0);
        assert!(res.p_value > 0.0 && res.p_value < 1.0);
    }

    #[test]
    fn test_wilcoxon_degenerate() {
        let res = wilcoxon_rank_sum_sparse(&[], 5, &[], 5);
        assert_eq!(res.p_value, 1.0);
        assert_relative_eq!(res.auc, 0.5);

        let res = wilcoxon_rank_sum_sparse(&[1.0], 1, &[], 0);
        assert_eq!(res.p_value, 1.0);
    }
}
