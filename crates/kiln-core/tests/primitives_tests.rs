// Integration tests for the kiln-core primitives
//
// Randomized checks of GEMM against a naive triple loop and of the
// im2col / col2im pair against the adjoint identity
// <im2col(x), c> == <x, col2im(c)>.

use kiln_core::im2col::output_dims;
use kiln_core::{col2im, gemm, im2col, DataType, KahanSum, Mat, Result, Transpose};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_mat(rng: &mut StdRng, height: usize, width: usize) -> Mat {
    Mat::from_fn(height, width, |_, _| rng.gen_range(-1.0..1.0))
}

fn dot(a: &[DataType], b: &[DataType]) -> f64 {
    a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum()
}

fn assert_vec_approx(got: &[DataType], expected: &[DataType], tol: DataType) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expected).enumerate() {
        assert!((g - e).abs() <= tol, "index {i}: got {g} expected {e} (tol {tol})");
    }
}

#[test]
fn gemm_matches_naive_for_every_transpose() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let (m, k, n) = (5, 4, 3);
    for ta in [Transpose::Normal, Transpose::Trans] {
        for tb in [Transpose::Normal, Transpose::Trans] {
            let a = match ta {
                Transpose::Normal => random_mat(&mut rng, m, k),
                Transpose::Trans => random_mat(&mut rng, k, m),
            };
            let b = match tb {
                Transpose::Normal => random_mat(&mut rng, k, n),
                Transpose::Trans => random_mat(&mut rng, n, k),
            };
            let a_at = |i: usize, l: usize| match ta {
                Transpose::Normal => a[(i, l)],
                Transpose::Trans => a[(l, i)],
            };
            let b_at = |l: usize, j: usize| match tb {
                Transpose::Normal => b[(l, j)],
                Transpose::Trans => b[(j, l)],
            };

            let c0 = random_mat(&mut rng, m, n);
            let mut c = c0.clone();
            gemm(ta, tb, 0.5, a.view(), b.view(), 2.0, c.view_mut())?;

            let expected = Mat::from_fn(m, n, |i, j| {
                let prod: DataType = (0..k).map(|l| a_at(i, l) * b_at(l, j)).sum();
                0.5 * prod + 2.0 * c0[(i, j)]
            });
            assert_vec_approx(c.as_slice(), expected.as_slice(), 1e-5);
        }
    }
    Ok(())
}

#[test]
fn gemm_beta_zero_discards_nan() -> Result<()> {
    let a = Mat::full(2, 2, 1.0);
    let mut c = Mat::full(2, 2, DataType::NAN);
    gemm(Transpose::Normal, Transpose::Normal, 1.0, a.view(), a.view(), 0.0, c.view_mut())?;
    assert_eq!(c.as_slice(), &[2.0; 4]);
    Ok(())
}

#[test]
fn col2im_is_adjoint_of_im2col() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(11);
    let cases: [(&[usize], &[usize], &[usize], &[usize]); 3] = [
        (&[7], &[1], &[3], &[2]),
        (&[5, 4], &[1, 0], &[3, 2], &[2, 1]),
        (&[3, 4, 3], &[0, 1, 1], &[2, 2, 3], &[1, 2, 1]),
    ];
    let channels = 2;
    for (image_dims, pads, window, strides) in cases {
        let out = output_dims(image_dims, pads, window, strides)?;
        let image_len = channels * image_dims.iter().product::<usize>();
        let rows = channels * window.iter().product::<usize>();
        let cols_len = rows * out.iter().product::<usize>();

        let x: Vec<DataType> = (0..image_len).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let c: Vec<DataType> = (0..cols_len).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let mut unfolded = vec![0.0; cols_len];
        im2col(&x, &mut unfolded, channels, image_dims, pads, window, strides)?;
        let mut folded = vec![0.0; image_len];
        col2im(&c, &mut folded, channels, image_dims, pads, window, strides)?;

        let lhs = dot(&unfolded, &c);
        let rhs = dot(&x, &folded);
        assert!((lhs - rhs).abs() < 1e-4, "{image_dims:?}: {lhs} vs {rhs}");
    }
    Ok(())
}

#[test]
fn kahan_beats_naive_on_mixed_magnitudes() {
    let values: Vec<DataType> = (0..10_000)
        .map(|i| if i % 2 == 0 { 1000.0 } else { 0.01 })
        .collect();
    let reference: f64 = values.iter().map(|&v| v as f64).sum();
    let naive: DataType = values.iter().sum();
    let compensated = values.iter().copied().collect::<KahanSum>().value();

    let naive_err = (naive as f64 - reference).abs();
    let compensated_err = (compensated as f64 - reference).abs();
    assert!(
        compensated_err * 10.0 <= naive_err,
        "compensated error {compensated_err}, naive error {naive_err}"
    );
}
