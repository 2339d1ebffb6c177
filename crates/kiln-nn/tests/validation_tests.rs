// Integration tests for shape validation
//
// Every check of the validator has a crafted configuration that trips it
// and nothing else, and every legal configuration derives the standard
// output size per spatial axis.

use kiln_core::{ErrorKind, Result, Shape};
use kiln_nn::{validate, ConvolutionConfig, ConvolutionKind, Device};

fn rejection(config: ConvolutionConfig, input: Shape, device: Device) -> String {
    let err = validate("probe", ConvolutionKind::Convolution, &config, &input, device)
        .expect_err("configuration should be rejected");
    assert_eq!(err.kind(), ErrorKind::Configuration);
    let message = err.to_string();
    assert!(message.contains("\"probe\""), "{message}");
    message
}

fn input() -> Shape {
    Shape::from((4, 8, 8))
}

fn base() -> ConvolutionConfig {
    ConvolutionConfig::new(6, vec![3, 3])
}

#[test]
fn base_configuration_is_valid_everywhere() -> Result<()> {
    for device in [Device::Cpu, Device::Gpu] {
        let g = validate("probe", ConvolutionKind::Convolution, &base(), &input(), device)?;
        assert_eq!(g.output_dims(), &Shape::from((6, 6, 6)));
    }
    Ok(())
}

#[test]
fn check_1_output_channels() {
    let msg = rejection(ConvolutionConfig::new(0, vec![3, 3]), input(), Device::Gpu);
    assert!(msg.contains("invalid number of output channels (0)"), "{msg}");
}

#[test]
fn check_2_groups() {
    let msg = rejection(base().with_groups(0), input(), Device::Gpu);
    assert!(msg.contains("invalid number of groups (0)"), "{msg}");
}

#[test]
fn check_3_group_divisibility() {
    // 4 input channels, 6 output channels: 3 divides only the latter
    let msg = rejection(base().with_groups(3), input(), Device::Gpu);
    assert!(msg.contains("does not divide"), "{msg}");
}

#[test]
fn check_4_kernel_dims() {
    let config = ConvolutionConfig::new(6, vec![3, 3])
        .with_pads(vec![0, 0])
        .with_strides(vec![1, 1])
        .with_dilations(vec![1, 1]);
    let msg = rejection(config, Shape::from((4, 8, 8, 8)), Device::Gpu);
    assert!(msg.contains("convolution kernel"), "{msg}");

    let msg = rejection(ConvolutionConfig::new(6, vec![3, 0]), input(), Device::Gpu);
    assert!(msg.contains("convolution kernel"), "{msg}");
}

#[test]
fn check_5_pads() {
    let msg = rejection(base().with_pads(vec![1]), input(), Device::Gpu);
    assert!(msg.contains("invalid convolution pads"), "{msg}");
    let msg = rejection(base().with_pads(vec![1, -1]), input(), Device::Gpu);
    assert!(msg.contains("invalid convolution pads"), "{msg}");
}

#[test]
fn check_6_strides() {
    let msg = rejection(base().with_strides(vec![1, 0]), input(), Device::Gpu);
    assert!(msg.contains("invalid convolution strides"), "{msg}");
}

#[test]
fn check_7_dilations() {
    let msg = rejection(base().with_dilations(vec![0, 1]), input(), Device::Gpu);
    assert!(msg.contains("invalid convolution dilations"), "{msg}");
}

#[test]
fn check_8_cpu_restrictions() -> Result<()> {
    let dilated = base().with_dilations(vec![2, 1]);
    let msg = rejection(dilated.clone(), input(), Device::Cpu);
    assert!(msg.contains("non-unit dilation"), "{msg}");
    validate("probe", ConvolutionKind::Convolution, &dilated, &input(), Device::Gpu)?;

    let grouped = base().with_groups(2);
    let msg = rejection(grouped.clone(), input(), Device::Cpu);
    assert!(msg.contains("only one group"), "{msg}");
    validate("probe", ConvolutionKind::Convolution, &grouped, &input(), Device::Gpu)?;
    Ok(())
}

#[test]
fn window_larger_than_padded_input() {
    let msg = rejection(ConvolutionConfig::new(1, vec![5]), Shape::from((1, 3)), Device::Cpu);
    assert!(msg.contains("invalid output dimension"), "{msg}");
}

#[test]
fn oversized_pad_is_rejected() {
    let config = ConvolutionConfig::new(1, vec![3]).with_pads(vec![i64::MAX / 2 + 1]);
    let msg = rejection(config, Shape::from((1, 8)), Device::Cpu);
    assert!(msg.contains("overflows"), "{msg}");
    assert!(msg.contains("spatial axis 0"), "{msg}");
}

#[test]
fn oversized_kernel_volume_is_rejected() {
    let config = ConvolutionConfig::new(1, vec![1 << 33, 1 << 33]).with_pads(vec![1 << 33, 1 << 33]);
    let msg = rejection(config, Shape::from((1, 1, 1)), Device::Gpu);
    assert!(msg.contains("kernel"), "{msg}");
    assert!(msg.contains("overflows"), "{msg}");
}

#[test]
fn oversized_output_volume_is_rejected() {
    let config = ConvolutionConfig::new(1 << 40, vec![1]);
    let msg = rejection(config, Shape::from((1, 1 << 30)), Device::Cpu);
    assert!(msg.contains("output"), "{msg}");
    assert!(msg.contains("overflows"), "{msg}");
}

#[test]
fn output_size_formula() -> Result<()> {
    for extent in [5i64, 8, 13] {
        for kernel in [1i64, 2, 3] {
            for pad in [0i64, 1, 2] {
                for stride in [1i64, 2, 3] {
                    for dilation in [1i64, 2] {
                        let span = extent + 2 * pad - dilation * (kernel - 1) - 1;
                        if span < 0 {
                            continue;
                        }
                        let config = ConvolutionConfig::new(2, vec![kernel])
                            .with_pads(vec![pad])
                            .with_strides(vec![stride])
                            .with_dilations(vec![dilation]);
                        let g = validate(
                            "probe",
                            ConvolutionKind::Convolution,
                            &config,
                            &Shape::from((3, extent as usize)),
                            Device::Gpu,
                        )?;
                        let expected = (span / stride + 1) as usize;
                        assert_eq!(g.output_dims().dims(), &[2, expected]);
                        assert_eq!(g.kernel_dims().dims(), &[2, 3, kernel as usize]);
                    }
                }
            }
        }
    }
    Ok(())
}

#[test]
fn deconvolution_inverts_convolution_size() -> Result<()> {
    let config = ConvolutionConfig::new(3, vec![3, 2])
        .with_pads(vec![1, 0])
        .with_strides(vec![2, 1]);
    let input = Shape::from((2, 7, 5));
    let conv = validate("c", ConvolutionKind::Convolution, &config, &input, Device::Cpu)?;
    assert_eq!(conv.output_dims(), &Shape::from((3, 4, 4)));

    let back = ConvolutionConfig::new(2, vec![3, 2])
        .with_pads(vec![1, 0])
        .with_strides(vec![2, 1]);
    let deconv = validate("d", ConvolutionKind::Deconvolution, &back, conv.output_dims(), Device::Cpu)?;
    assert_eq!(deconv.output_dims(), &input);
    assert_eq!(deconv.kernel_dims(), &Shape::from((3, 2, 3, 2)));
    Ok(())
}
