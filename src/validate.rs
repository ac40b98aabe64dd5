use log::warn;
use num_traits::Float;

/// Per-element mismatches reported before going quiet.
const MAX_REPORTED_DIFFS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Validation {
    /// `sqrt(Σ(r - p)² / Σ 2r²)`
    pub nrms: f64,
    /// Elements whose relative error exceeds the tolerance.
    pub mismatches: usize,
    pub valid: bool,
}

/// Compares `pred` against `reference`: valid iff the normalised RMS error
/// is below `tolerance` and no single element is off by more than
/// `tolerance` relative to its reference (absolute where the reference is
/// zero).
pub fn valid_vector<T: Float>(reference: &[T], pred: &[T], tolerance: f64) -> Validation {
    assert_eq!(reference.len(), pred.len(), "Reference and prediction lengths differ!");
    let mut s0 = 0.0f64;
    let mut s1 = 0.0f64;
    let mut mismatches = 0;

    for (i, (r, p)) in reference.iter().zip(pred).enumerate() {
        let ri = r.to_f64().unwrap_or(f64::NAN);
        let pi = p.to_f64().unwrap_or(f64::NAN);
        let d = ri - pi;
        s0 += d * d;
        s1 += 2.0 * ri * ri;

        let delta = if ri == 0.0 { d.abs() } else { (d / ri).abs() };
        // NaN fails this comparison, so it has to count explicitly.
        if !(delta <= tolerance) {
            if mismatches < MAX_REPORTED_DIFFS {
                warn!("diff at {i:4}, ref:{ri:.6}, pred:{pi:.6}, d:{delta:.6}");
            }
            mismatches += 1;
        }
    }

    let nrms = if s0 == 0.0 { 0.0 } else { (s0 / s1).sqrt() };
    Validation {
        nrms,
        mismatches,
        valid: nrms < tolerance && mismatches == 0,
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_identical_vectors_are_valid() {
        let v = [0.5f32, 1.25, 3.0];
        let result = valid_vector(&v, &v, 1e-3);
        assert_eq!(result.nrms, 0.0);
        assert_eq!(result.mismatches, 0);
        assert!(result.valid);
    }

    #[test]
    fn test_all_zero_vectors_are_valid() {
        let zeros = [0.0f32; 8];
        assert!(valid_vector(&zeros, &zeros, 1e-3).valid);
    }

    #[test]
    fn test_small_relative_error_passes() {
        let reference = [1000.0f64, 2000.0];
        let pred = [1000.0001f64, 1999.9999];
        assert!(valid_vector(&reference, &pred, 1e-3).valid);
    }

    #[test]
    fn test_single_bad_element_fails() {
        let reference = vec![1.0f32; 1000];
        let mut pred = reference.clone();
        pred[17] = 1.01;
        let result = valid_vector(&reference, &pred, 1e-3);
        // Diluted over 1000 elements the NRMS stays tiny; the element check
        // still catches it.
        assert!(result.nrms < 1e-3);
        assert_eq!(result.mismatches, 1);
        assert!(!result.valid);
    }

    #[test]
    fn test_nonzero_against_zero_reference_fails() {
        let result = valid_vector(&[0.0f32, 1.0], &[0.5, 1.0], 1e-3);
        assert_eq!(result.mismatches, 1);
        assert!(!result.valid);
    }

    #[test]
    fn test_nan_prediction_fails() {
        let result = valid_vector(&[1.0f32, 2.0], &[f32::NAN, 2.0], 1e-3);
        assert_eq!(result.mismatches, 1);
        assert!(!result.valid);
    }

    #[test]
    fn test_nrms_formula() {
        let result = valid_vector(&[3.0f64, 4.0], &[3.0, 3.0], 1.0);
        let expected = (1.0f64 / (2.0 * 9.0 + 2.0 * 16.0)).sqrt();
        assert!((result.nrms - expected).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_tiny_relative_noise_is_valid(
            values in prop::collection::vec(0.01f64..1000.0, 1..256),
            scale in -1e-5f64..1e-5,
        ) {
            let pred: Vec<f64> = values.iter().map(|v| v * (1.0 + scale)).collect();
            let result = valid_vector(&values, &pred, 1e-3);
            prop_assert!(result.valid, "{:?}", result);
        }

        #[test]
        fn prop_nrms_is_symmetric_in_sign_of_error(
            values in prop::collection::vec(0.01f64..10.0, 1..64),
            delta in 0.0f64..1.0,
        ) {
            let above: Vec<f64> = values.iter().map(|v| v + delta).collect();
            let below: Vec<f64> = values.iter().map(|v| v - delta).collect();
            let a = valid_vector(&values, &above, 1e-3).nrms;
            let b = valid_vector(&values, &below, 1e-3).nrms;
            prop_assert!((a - b).abs() <= 1e-9 * a.max(1.0));
        }
    }
}
