//! Property-based tests using proptest.
//!
//! These tests verify the shape and range invariants of the layers.

use convgate::autograd::Tensor;
use convgate::nn::{
    conv2d_gru, conv2d_lstm, conv2d_v2, format_input_left_padding, saturating_sigmoid,
    Conv2dConfig, Padding, VarStore,
};
use proptest::prelude::*;

fn odd_filter() -> impl Strategy<Value = usize> {
    prop_oneof![Just(1usize), Just(3), Just(5)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn saturating_sigmoid_is_bounded_and_monotonic(
        mut values in proptest::collection::vec(-20.0f32..20.0, 1..64)
    ) {
        values.sort_by(f32::total_cmp);
        let y = saturating_sigmoid(&Tensor::from_slice(&values));

        for &v in y.data() {
            prop_assert!((0.0..=1.0).contains(&v));
        }
        for pair in y.data().windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn saturating_sigmoid_saturates(x in 3.0f32..1000.0) {
        let y = saturating_sigmoid(&Tensor::from_slice(&[-x, x]));
        prop_assert_eq!(y.data()[0], 0.0);
        prop_assert_eq!(y.data()[1], 1.0);
    }

    #[test]
    fn left_padding_offsets_by_dilated_filter(
        batch in 1usize..3,
        height in 1usize..8,
        width in 1usize..8,
        channels in 1usize..3,
        fh in odd_filter(),
        fw in odd_filter(),
        dh in 1usize..4,
        dw in 1usize..4,
    ) {
        let x = Tensor::zeros(&[batch, height, width, channels]);
        let cfg = Conv2dConfig::default()
            .with_filter_size((fh, fw))
            .with_dilation((dh, dw))
            .with_padding(Padding::Left);
        let (padded, valid_cfg) = format_input_left_padding(&x, &cfg).expect("odd filter");

        prop_assert_eq!(valid_cfg.padding, Padding::Valid);
        prop_assert_eq!(padded.shape()[0], batch);
        prop_assert_eq!(padded.shape()[3], channels);
        prop_assert_eq!(padded.shape()[1] - (fh - 1) * dh, height);
        if width == 1 {
            prop_assert_eq!(padded.shape()[2], 1);
        } else {
            prop_assert_eq!(padded.shape()[2] - (fw - 1) * dw, width);
        }
    }

    #[test]
    fn even_filters_are_rejected(half in 1usize..4, other in odd_filter()) {
        let x = Tensor::zeros(&[1, 4, 4, 1]);
        let cfg = Conv2dConfig::default()
            .with_filter_size((other, 2 * half))
            .with_padding(Padding::Left);
        prop_assert!(format_input_left_padding(&x, &cfg).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn left_padded_conv_keeps_spatial_size(
        height in 1usize..6,
        width in 2usize..6,
        fh in odd_filter(),
        fw in odd_filter(),
        dilation in 1usize..3,
        n_out in 1usize..4,
    ) {
        let store = VarStore::new();
        let x = Tensor::full(&[1, height, width, 2], 0.5);
        let cfg = Conv2dConfig::default()
            .with_filter_size((fh, fw))
            .with_dilation(dilation)
            .with_padding(Padding::Left);
        let y = conv2d_v2(&store.root(), &x, n_out, true, false, &cfg).expect("conv");
        prop_assert_eq!(y.shape(), &[1, height, width, n_out][..]);
    }

    #[test]
    fn gru_output_matches_input_shape(
        batch in 1usize..3,
        height in 1usize..5,
        width in 1usize..5,
        channels in 1usize..4,
        dilation in 1usize..3,
    ) {
        let store = VarStore::new();
        let x = Tensor::full(&[batch, height, width, channels], 0.25);
        let cfg = Conv2dConfig::conv2d_gru().with_dilation(dilation);
        let y = conv2d_gru(&store.root(), &x, channels, true, false, &cfg).expect("gru");
        prop_assert_eq!(y.shape(), x.shape());
    }

    #[test]
    fn lstm_output_has_requested_channels(
        batch in 1usize..3,
        height in 1usize..5,
        width in 1usize..5,
        in_channels in 1usize..4,
        n_out in 1usize..4,
    ) {
        let store = VarStore::new();
        let x = Tensor::full(&[batch, height, width, in_channels], -0.5);
        let (h, state) = conv2d_lstm(&store.root(), &x, None, n_out, true, false, &Conv2dConfig::conv2d_lstm())
            .expect("lstm");
        prop_assert_eq!(h.shape(), &[batch, height, width, n_out][..]);
        prop_assert_eq!(state.cell.shape(), h.shape());
        for &v in h.data() {
            prop_assert!(v.abs() < 1.0);
        }
    }
}
