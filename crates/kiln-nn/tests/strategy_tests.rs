// Integration tests for the execution strategies
//
// The portable GEMM strategy and the accelerator strategy over the host
// library must compute the same four primitives. The host library doubles
// as the reference direct-sum implementation.

use kiln_core::{DataType, Mat, Result, Shape};
use kiln_nn::strategy::gemm::channel_sums;
use kiln_nn::{
    validate, AcceleratorConfig, AcceleratorStrategy, ConvGeometry, ConvolutionConfig,
    ConvolutionKind, ConvolutionStrategy, Device, Direction, GemmStrategy, GradientTarget,
    HostConvLibrary,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn assert_vec_approx(got: &[DataType], expected: &[DataType], tol: DataType) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected).enumerate() {
        assert!((g - e).abs() <= tol, "index {i}: got {g} expected {e} (tol {tol})");
    }
}

fn random_mat(rng: &mut StdRng, height: usize, width: usize) -> Mat {
    Mat::from_fn(height, width, |_, _| rng.gen_range(-1.0..1.0))
}

fn geometries(kind: ConvolutionKind, config: &ConvolutionConfig, input: &Shape) -> Result<(ConvGeometry, ConvGeometry)> {
    Ok((
        validate("cpu", kind, config, input, Device::Cpu)?,
        validate("gpu", kind, config, input, Device::Gpu)?,
    ))
}

fn host_strategy(lib: &HostConvLibrary, geometry: &ConvGeometry) -> Result<AcceleratorStrategy<HostConvLibrary>> {
    let mut s = AcceleratorStrategy::new(lib.clone(), AcceleratorConfig::default());
    s.prepare(geometry)?;
    Ok(s)
}

/// Run every primitive through both strategies and compare.
fn check_agreement(kind: ConvolutionKind, config: ConvolutionConfig, input_dims: Shape, width: usize) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let (cpu, gpu) = geometries(kind, &config, &input_dims)?;
    let lib = HostConvLibrary::new();
    let mut gemm = GemmStrategy::new();
    let mut host = host_strategy(&lib, &gpu)?;

    let in_size = cpu.input_size();
    let out_size = cpu.output_size();
    let kernel = random_mat(&mut rng, cpu.kernel_size(), 1);
    let bias = random_mat(&mut rng, cpu.output_dims().channels(), 1);
    let input = random_mat(&mut rng, in_size, width);
    let grad_out = random_mat(&mut rng, out_size, width);

    // forward primitive of the layer kind, then bias
    let mut y_cpu = Mat::full(out_size, width, DataType::NAN);
    let mut y_gpu = Mat::full(out_size, width, DataType::NAN);
    match kind {
        ConvolutionKind::Convolution => {
            gemm.apply_convolution(&cpu, Direction::Forward, kernel.view(), input.view(), y_cpu.view_mut())?;
            host.apply_convolution(&gpu, Direction::Forward, kernel.view(), input.view(), y_gpu.view_mut())?;
        }
        ConvolutionKind::Deconvolution => {
            gemm.apply_transposed_convolution(&cpu, Direction::Forward, kernel.view(), input.view(), y_cpu.view_mut())?;
            host.apply_transposed_convolution(&gpu, Direction::Forward, kernel.view(), input.view(), y_gpu.view_mut())?;
        }
    }
    gemm.apply_bias(&cpu, bias.view(), y_cpu.view_mut())?;
    host.apply_bias(&gpu, bias.view(), y_gpu.view_mut())?;
    assert_vec_approx(y_cpu.as_slice(), y_gpu.as_slice(), 1e-4);

    // backward data
    let mut dx_cpu = Mat::full(in_size, width, DataType::NAN);
    let mut dx_gpu = Mat::full(in_size, width, DataType::NAN);
    match kind {
        ConvolutionKind::Convolution => {
            gemm.apply_transposed_convolution(&cpu, Direction::Backward, kernel.view(), grad_out.view(), dx_cpu.view_mut())?;
            host.apply_transposed_convolution(&gpu, Direction::Backward, kernel.view(), grad_out.view(), dx_gpu.view_mut())?;
        }
        ConvolutionKind::Deconvolution => {
            gemm.apply_convolution(&cpu, Direction::Backward, kernel.view(), grad_out.view(), dx_cpu.view_mut())?;
            host.apply_convolution(&gpu, Direction::Backward, kernel.view(), grad_out.view(), dx_gpu.view_mut())?;
        }
    }
    assert_vec_approx(dx_cpu.as_slice(), dx_gpu.as_slice(), 1e-4);

    // gradients, accumulated on top of a decayed prior
    let using_transposed = kind == ConvolutionKind::Deconvolution;
    let prior_kernel = random_mat(&mut rng, cpu.kernel_size(), 1);
    let prior_bias = random_mat(&mut rng, bias.height(), 1);
    let mut results = Vec::new();
    for strategy in [&mut gemm as &mut dyn ConvolutionStrategy, &mut host] {
        let geometry = if strategy.device() == Device::Cpu { &cpu } else { &gpu };
        let mut dw = prior_kernel.clone();
        let mut db = prior_bias.clone();
        strategy.compute_gradients(
            geometry,
            using_transposed,
            input.view(),
            grad_out.view(),
            Some(GradientTarget {
                dst_scale: 0.5,
                gradient_scale: 0.25,
                values: dw.view_mut(),
            }),
            Some(GradientTarget {
                dst_scale: 0.5,
                gradient_scale: 0.25,
                values: db.view_mut(),
            }),
        )?;
        results.push((dw, db));
    }
    assert_vec_approx(results[0].0.as_slice(), results[1].0.as_slice(), 1e-4);
    assert_vec_approx(results[0].1.as_slice(), results[1].1.as_slice(), 1e-4);
    Ok(())
}

#[test]
fn convolution_2d_agreement() -> Result<()> {
    init_logging();
    let config = ConvolutionConfig::new(3, vec![3, 2])
        .with_pads(vec![1, 0])
        .with_strides(vec![2, 1]);
    check_agreement(ConvolutionKind::Convolution, config, Shape::from((2, 5, 4)), 3)
}

#[test]
fn convolution_1d_agreement() -> Result<()> {
    let config = ConvolutionConfig::new(4, vec![3]).with_pads(vec![2]).with_strides(vec![3]);
    check_agreement(ConvolutionKind::Convolution, config, Shape::from((3, 11)), 2)
}

#[test]
fn convolution_3d_agreement() -> Result<()> {
    let config = ConvolutionConfig::new(2, vec![2, 2, 2]).with_pads(vec![0, 1, 0]);
    check_agreement(ConvolutionKind::Convolution, config, Shape::from((2, 3, 3, 4)), 2)
}

#[test]
fn deconvolution_2d_agreement() -> Result<()> {
    let config = ConvolutionConfig::new(2, vec![3, 3])
        .with_pads(vec![1, 1])
        .with_strides(vec![2, 2]);
    check_agreement(ConvolutionKind::Deconvolution, config, Shape::from((3, 3, 4)), 2)
}

#[test]
fn transposed_of_ones_counts_window_coverage() -> Result<()> {
    // length 5, window 3, stride 2, pad 1: windows cover (-1, 0, 1),
    // (1, 2, 3) and (3, 4, 5)
    let config = ConvolutionConfig::new(1, vec![3]).with_pads(vec![1]).with_strides(vec![2]);
    let (cpu, gpu) = geometries(ConvolutionKind::Convolution, &config, &Shape::from((1, 5)))?;
    let kernel = Mat::full(3, 1, 1.0);
    let ones = Mat::full(3, 1, 1.0);
    let expected = [1.0, 2.0, 1.0, 2.0, 1.0];

    let mut dx = Mat::zeros(5, 1);
    GemmStrategy::new().apply_transposed_convolution(&cpu, Direction::Backward, kernel.view(), ones.view(), dx.view_mut())?;
    assert_eq!(dx.as_slice(), &expected);

    let lib = HostConvLibrary::new();
    let mut host = host_strategy(&lib, &gpu)?;
    let mut dx = Mat::zeros(5, 1);
    host.apply_transposed_convolution(&gpu, Direction::Backward, kernel.view(), ones.view(), dx.view_mut())?;
    assert_eq!(dx.as_slice(), &expected);
    Ok(())
}

#[test]
fn forward_and_transposed_are_adjoint() -> Result<()> {
    // <conv(x), y> == <x, conv^T(y)>
    let mut rng = StdRng::seed_from_u64(3);
    let config = ConvolutionConfig::new(3, vec![3, 3])
        .with_pads(vec![1, 2])
        .with_strides(vec![2, 1]);
    let (cpu, _) = geometries(ConvolutionKind::Convolution, &config, &Shape::from((2, 6, 5)))?;
    let kernel = random_mat(&mut rng, cpu.kernel_size(), 1);
    let x = random_mat(&mut rng, cpu.input_size(), 2);
    let y = random_mat(&mut rng, cpu.output_size(), 2);

    let mut gemm = GemmStrategy::new();
    let mut conv_x = Mat::zeros(cpu.output_size(), 2);
    gemm.apply_convolution(&cpu, Direction::Forward, kernel.view(), x.view(), conv_x.view_mut())?;
    let mut conv_t_y = Mat::zeros(cpu.input_size(), 2);
    gemm.apply_transposed_convolution(&cpu, Direction::Backward, kernel.view(), y.view(), conv_t_y.view_mut())?;

    let dot = |a: &Mat, b: &Mat| -> f64 {
        a.as_slice().iter().zip(b.as_slice()).map(|(p, q)| *p as f64 * *q as f64).sum()
    };
    let lhs = dot(&conv_x, &y);
    let rhs = dot(&x, &conv_t_y);
    assert!((lhs - rhs).abs() < 1e-3, "{lhs} vs {rhs}");
    Ok(())
}

#[test]
fn grouped_dilated_accelerator_matches_per_group_reference() -> Result<()> {
    // Two groups are two independent single-group convolutions.
    let mut rng = StdRng::seed_from_u64(5);
    let input_dims = Shape::from((4, 7));
    let grouped = ConvolutionConfig::new(2, vec![2]).with_groups(2).with_dilations(vec![2]);
    let single = ConvolutionConfig::new(1, vec![2]).with_dilations(vec![2]);
    let g = validate("grouped", ConvolutionKind::Convolution, &grouped, &input_dims, Device::Gpu)?;
    let s = validate("single", ConvolutionKind::Convolution, &single, &Shape::from((2, 7)), Device::Gpu)?;

    let lib = HostConvLibrary::new();
    let mut grouped_strategy = host_strategy(&lib, &g)?;
    let mut single_strategy = host_strategy(&lib, &s)?;

    // kernel [2, 2, 2]: output channel k sees input channels 2k, 2k + 1
    let kernel = random_mat(&mut rng, g.kernel_size(), 1);
    let input = random_mat(&mut rng, g.input_size(), 1);
    let mut output = Mat::zeros(g.output_size(), 1);
    grouped_strategy.apply_convolution(&g, Direction::Forward, kernel.view(), input.view(), output.view_mut())?;

    let out_len = s.output_size();
    for group in 0..2 {
        let k = Mat::from_vec(4, 1, kernel.as_slice()[group * 4..(group + 1) * 4].to_vec())?;
        let x = Mat::from_vec(14, 1, input.as_slice()[group * 14..(group + 1) * 14].to_vec())?;
        let mut y = Mat::zeros(out_len, 1);
        single_strategy.apply_convolution(&s, Direction::Forward, k.view(), x.view(), y.view_mut())?;
        assert_vec_approx(y.as_slice(), &output.as_slice()[group * out_len..(group + 1) * out_len], 1e-5);
    }
    Ok(())
}

#[test]
fn empty_partition_is_a_no_op() -> Result<()> {
    let config = ConvolutionConfig::new(2, vec![2]);
    let (cpu, gpu) = geometries(ConvolutionKind::Convolution, &config, &Shape::from((1, 4)))?;
    let lib = HostConvLibrary::new();
    let mut host = host_strategy(&lib, &gpu)?;
    let mut gemm = GemmStrategy::new();
    let calls_before = lib.stats().compute_calls;

    let kernel = Mat::full(cpu.kernel_size(), 1, 1.0);
    let bias = Mat::full(2, 1, 1.0);
    let no_samples = Mat::zeros(cpu.input_size(), 0);
    let no_rows = Mat::zeros(0, 2);

    for strategy in [&mut gemm as &mut dyn ConvolutionStrategy, &mut host] {
        let geometry = if strategy.device() == Device::Cpu { &cpu } else { &gpu };
        let mut output = Mat::full(geometry.output_size(), 2, 7.0);
        strategy.apply_convolution(geometry, Direction::Forward, kernel.view(), no_samples.view(), output.view_mut())?;
        strategy.apply_transposed_convolution(geometry, Direction::Forward, kernel.view(), no_rows.view(), output.view_mut())?;
        assert!(output.as_slice().iter().all(|&v| v == 7.0));

        let mut empty_output = Mat::zeros(geometry.output_size(), 0);
        strategy.apply_bias(geometry, bias.view(), empty_output.view_mut())?;

        let mut dw = Mat::full(geometry.kernel_size(), 1, 3.0);
        let mut db = Mat::full(2, 1, 3.0);
        strategy.compute_gradients(
            geometry,
            false,
            no_samples.view(),
            no_rows.view(),
            Some(GradientTarget {
                dst_scale: 1.0,
                gradient_scale: 0.25,
                values: dw.view_mut(),
            }),
            Some(GradientTarget {
                dst_scale: 1.0,
                gradient_scale: 0.25,
                values: db.view_mut(),
            }),
        )?;
        assert!(dw.as_slice().iter().all(|&v| v == 3.0));
        assert!(db.as_slice().iter().all(|&v| v == 3.0));
    }
    assert_eq!(lib.stats().compute_calls, calls_before);
    assert_eq!(lib.stats().algorithm_queries(), 0);
    Ok(())
}

#[test]
fn empty_partition_still_decays_gradients() -> Result<()> {
    let config = ConvolutionConfig::new(2, vec![2]);
    let (_, gpu) = geometries(ConvolutionKind::Convolution, &config, &Shape::from((1, 4)))?;
    let lib = HostConvLibrary::new();
    let mut host = host_strategy(&lib, &gpu)?;
    let mut dw = Mat::full(gpu.kernel_size(), 1, 3.0);
    host.compute_gradients(
        &gpu,
        false,
        Mat::zeros(gpu.input_size(), 0).view(),
        Mat::zeros(gpu.output_size(), 0).view(),
        Some(GradientTarget {
            dst_scale: 0.5,
            gradient_scale: 0.25,
            values: dw.view_mut(),
        }),
        None,
    )?;
    assert!(dw.as_slice().iter().all(|&v| v == 1.5));
    assert_eq!(lib.stats().compute_calls, 0);
    Ok(())
}

#[test]
fn bias_gradient_sums_are_compensated() -> Result<()> {
    // one channel, 10 000 alternating large/small entries over 4 columns
    let values: Vec<DataType> = (0..10_000)
        .map(|i| if i % 2 == 0 { 1000.0 } else { 0.01 })
        .collect();
    let grad = Mat::from_vec(2_500, 4, values.clone())?;
    let reference: f64 = values.iter().map(|&v| v as f64).sum();
    let naive: DataType = values.iter().sum();
    let sums = channel_sums(grad.view(), 1, 2_500);

    let naive_err = (naive as f64 - reference).abs();
    let compensated_err = (sums[0] as f64 - reference).abs();
    assert!(
        compensated_err * 10.0 <= naive_err,
        "compensated error {compensated_err}, naive error {naive_err}"
    );
    Ok(())
}
