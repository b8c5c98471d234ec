use candle_core::{DType, Result, Tensor, D};

use crate::config::SearchParams;

/// Scales each row to unit L2 norm. Rows with a vanishing norm are divided
/// by `1e-12` instead, so they stay finite.
pub fn normalize(xs: &Tensor) -> Result<Tensor> {
    let eps = Tensor::new(1e-12f32, xs.device())?.to_dtype(xs.dtype())?;
    let norm = xs
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .sqrt()?
        .broadcast_maximum(&eps)?;
    xs.broadcast_div(&norm)
}

/// `1 - mean(cos(edited_i, target))`.
///
/// `target` is a single embedding (`[E]` or `[1, E]`) that is already unit
/// length.
pub fn transfer_loss(edited: &Tensor, target: &Tensor) -> Result<Tensor> {
    let embed_dim = edited.dim(D::Minus1)?;
    let target = target.reshape((1, embed_dim))?;
    let similarity = normalize(edited)?.matmul(&target.t()?)?;
    similarity.mean_all()?.affine(-1., 1.)
}

/// `1 - cos` between every pair of edit shifts, with the diagonal zeroed.
pub fn pairwise_dissimilarity(edited: &Tensor, baseline: &Tensor) -> Result<Tensor> {
    let diffs = normalize(&(edited - baseline)?)?;
    let n = diffs.dim(0)?;
    let similarity = diffs.matmul(&diffs.t()?)?;
    let off_diagonal: Vec<f32> = (0..n * n)
        .map(|k| if k / n != k % n { 1. } else { 0. })
        .collect();
    let mask = Tensor::from_vec(off_diagonal, (n, n), diffs.device())?.to_dtype(diffs.dtype())?;
    similarity.affine(-1., 1.)?.mul(&mask)
}

/// Mean pairwise dissimilarity of the edit shifts over the `N^2 - N`
/// off-diagonal pairs.
pub fn consistency_loss(edited: &Tensor, baseline: &Tensor) -> Result<Tensor> {
    let n = edited.dim(0)?;
    if n < 2 {
        candle_core::bail!("consistency loss needs at least 2 images, got {n}")
    }
    let pairs = (n * n - n) as f64;
    pairwise_dissimilarity(edited, baseline)?
        .sum_all()?
        .affine(1. / pairs, 0.)
}

/// Scalar values of one evaluation, for logging and best tracking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossValues {
    pub total: f32,
    pub transfer: f32,
    /// `None` when the consistency weight is zero and the term was skipped.
    pub consistency: Option<f32>,
}

impl LossValues {
    pub fn describe(&self) -> String {
        match self.consistency {
            Some(consistency) => format!(
                "loss: {:.4}; consistency loss: {:.4}; transfer loss: {:.4}",
                self.total, consistency, self.transfer
            ),
            None => format!(
                "loss: {:.4}; transfer loss: {:.4}",
                self.total, self.transfer
            ),
        }
    }
}

pub struct Objective {
    pub loss: Tensor,
    pub values: LossValues,
}

/// Weighted sum of the transfer and consistency terms.
pub fn objective(
    edited: &Tensor,
    baseline: &Tensor,
    target: &Tensor,
    params: &SearchParams,
) -> Result<Objective> {
    let transfer = transfer_loss(edited, target)?;
    let mut loss = transfer.affine(params.lambda_transfer, 0.)?;

    let consistency = if params.consistency_enabled() {
        let consistency = consistency_loss(edited, baseline)?;
        loss = (loss + consistency.affine(params.lambda_consistency, 0.)?)?;
        Some(scalar(&consistency)?)
    } else {
        None
    };

    let values = LossValues {
        total: scalar(&loss)?,
        transfer: scalar(&transfer)?,
        consistency,
    };
    Ok(Objective { loss, values })
}

fn scalar(xs: &Tensor) -> Result<f32> {
    xs.to_dtype(DType::F32)?.to_scalar::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use proptest::prelude::*;

    fn t(data: &[f32], rows: usize) -> Tensor {
        Tensor::from_slice(data, (rows, data.len() / rows), &Device::Cpu).unwrap()
    }

    #[test]
    fn normalized_rows_have_unit_norm() -> Result<()> {
        let xs = t(&[3., 4., 0., 0., 5., 12.], 3);
        let norms = normalize(&xs)?.sqr()?.sum(1)?.sqrt()?.to_vec1::<f32>()?;
        for n in norms {
            assert!((n - 1.).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn zero_row_stays_finite() -> Result<()> {
        let xs = t(&[0., 0.], 1);
        let out = normalize(&xs)?.to_vec2::<f32>()?;
        assert_eq!(out, vec![vec![0., 0.]]);
        Ok(())
    }

    #[test]
    fn transfer_loss_is_zero_on_target() -> Result<()> {
        let edited = t(&[2., 0., 5., 0.], 2);
        let target = Tensor::new(&[1f32, 0.], &Device::Cpu)?;
        assert!(transfer_loss(&edited, &target)?.to_scalar::<f32>()?.abs() < 1e-6);

        let opposite = t(&[-1., 0.], 1);
        let loss = transfer_loss(&opposite, &target)?.to_scalar::<f32>()?;
        assert!((loss - 2.).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn consistency_averages_off_diagonal_pairs() -> Result<()> {
        let baseline = t(&[0., 0., 0., 0., 0., 0.], 3);
        // Shifts: +x, +x, +y. Pairs (0,1) agree; the four involving 2 are orthogonal.
        let edited = t(&[1., 0., 2., 0., 0., 1.], 3);
        let loss = consistency_loss(&edited, &baseline)?.to_scalar::<f32>()?;
        assert!((loss - 4. / 6.).abs() < 1e-6, "{loss}");

        let terms = pairwise_dissimilarity(&edited, &baseline)?.to_vec2::<f32>()?;
        for i in 0..3 {
            assert_eq!(terms[i][i], 0.);
        }
        Ok(())
    }

    #[test]
    fn consistency_rejects_single_image() {
        let xs = t(&[1., 0.], 1);
        assert!(consistency_loss(&xs, &xs).is_err());
    }

    #[test]
    fn zero_consistency_weight_skips_term() -> Result<()> {
        let baseline = t(&[0., 1., 1., 0.], 2);
        let edited = t(&[1., 1., 1., 1.], 2);
        let target = Tensor::new(&[1f32, 0.], &Device::Cpu)?;
        let params = SearchParams {
            lambda_consistency: 0.0,
            ..Default::default()
        };
        let objective = objective(&edited, &baseline, &target, &params)?;
        assert_eq!(objective.values.consistency, None);
        assert_eq!(objective.values.total, objective.values.transfer);
        assert!(!objective.values.describe().contains("consistency"));
        Ok(())
    }

    #[test]
    fn objective_weights_terms() -> Result<()> {
        let baseline = t(&[0., 0., 0., 0.], 2);
        let edited = t(&[1., 0., 0., 1.], 2);
        let target = Tensor::new(&[1f32, 0.], &Device::Cpu)?;
        let params = SearchParams {
            lambda_transfer: 2.0,
            lambda_consistency: 0.5,
            ..Default::default()
        };
        let objective = objective(&edited, &baseline, &target, &params)?;
        let values = objective.values;
        assert!((values.transfer - 0.5).abs() < 1e-6);
        assert!((values.consistency.unwrap() - 1.0).abs() < 1e-6);
        assert!((values.total - 1.5).abs() < 1e-6);
        Ok(())
    }

    proptest! {
        #[test]
        fn consistency_terms_within_bounds(
            data in proptest::collection::vec(-5.0f32..5.0, 12),
            base in proptest::collection::vec(-5.0f32..5.0, 12),
        ) {
            let edited = t(&data, 4);
            let baseline = t(&base, 4);
            let terms = pairwise_dissimilarity(&edited, &baseline).unwrap().to_vec2::<f32>().unwrap();
            for row in &terms {
                for v in row {
                    prop_assert!(*v >= -1e-5 && *v <= 2. + 1e-5);
                }
            }
            let loss = consistency_loss(&edited, &baseline).unwrap().to_scalar::<f32>().unwrap();
            let mean = terms.iter().flatten().sum::<f32>() / 12.;
            prop_assert!((loss - mean).abs() < 1e-4);
        }
    }
}
