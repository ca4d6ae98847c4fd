use super::*;
use approx::assert_relative_eq;
use ndarray::Array4;

use crate::error::AttentionError;

fn det_data(n: usize, phase: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32 * 0.23) + phase).sin() * 0.5).collect()
}

fn small_inputs() -> AttentionInputs {
    let (b, h, sq, sk, d, dv) = (1, 2, 4, 5, 8, 6);
    AttentionInputs::new(
        Array4::from_shape_vec((b, h, sq, d), det_data(b * h * sq * d, 0.0)).unwrap(),
        Array4::from_shape_vec((b, h, sk, d), det_data(b * h * sk * d, 1.1)).unwrap(),
        Array4::from_shape_vec((b, h, sk, dv), det_data(b * h * sk * dv, 2.2)).unwrap(),
    )
}

#[test]
fn test_forward_backward_roundtrip_portable() {
    let dispatcher = AttentionDispatcher::portable();
    assert_eq!(dispatcher.backend(), Backend::Portable);

    let inputs = small_inputs();
    let (output, mut context) = dispatcher.forward(&inputs).unwrap();
    assert_eq!(output.dim(), (1, 2, 4, 6));
    assert_eq!(context.backend(), Backend::Portable);
    assert!(!context.is_consumed());

    let grad_output = Array4::from_elem(output.dim(), 1.0);
    let grads = dispatcher.backward(&mut context, &grad_output).unwrap();
    assert!(context.is_consumed());

    assert_eq!(grads.query.dim(), inputs.query.dim());
    assert_eq!(grads.key.dim(), inputs.key.dim());
    assert_eq!(grads.value.dim(), inputs.value.dim());

    // the dispatcher adds nothing numerically: it must match the kernel
    let dims = inputs.validate().unwrap();
    let kernel = PortableAttentionKernel::new();
    let (direct_out, direct_saved) = kernel.forward_impl(&inputs, &dims);
    let direct_grads = kernel.backward_impl(&direct_saved, &grad_output);
    for (a, b) in output.iter().zip(direct_out.iter()) {
        assert_relative_eq!(a, b);
    }
    for (a, b) in grads.query.iter().zip(direct_grads.query.iter()) {
        assert_relative_eq!(a, b);
    }
}

#[test]
fn test_consumed_context_is_rejected() {
    let dispatcher = AttentionDispatcher::portable();
    let inputs = small_inputs();
    let (output, mut context) = dispatcher.forward(&inputs).unwrap();
    let grad_output = Array4::from_elem(output.dim(), 1.0);

    dispatcher.backward(&mut context, &grad_output).unwrap();
    let err = dispatcher.backward(&mut context, &grad_output).unwrap_err();
    assert!(matches!(err, AttentionError::InvalidContext(_)));
}

#[test]
fn test_foreign_context_is_rejected() {
    let dispatcher_a = AttentionDispatcher::portable();
    let dispatcher_b = AttentionDispatcher::portable();
    let inputs = small_inputs();

    let (output, mut context) = dispatcher_a.forward(&inputs).unwrap();
    let grad_output = Array4::from_elem(output.dim(), 1.0);

    let err = dispatcher_b.backward(&mut context, &grad_output).unwrap_err();
    assert!(matches!(err, AttentionError::InvalidContext(_)));

    // the failed call must not have consumed the context
    assert!(!context.is_consumed());
    assert!(dispatcher_a.backward(&mut context, &grad_output).is_ok());
}

#[test]
fn test_backward_routes_by_recorded_tag_not_dispatcher_state() {
    // A context whose tag disagrees with its saved state: backward must
    // consult the tag. With a Fused tag on a fused-less dispatcher the
    // routing fails before the portable kernel is ever considered.
    let dispatcher = AttentionDispatcher::portable();
    let inputs = small_inputs();
    let (output, context) = dispatcher.forward(&inputs).unwrap();

    let mut forged = AttentionContext {
        backend: Backend::Fused,
        dispatcher: dispatcher.id,
        dims: context.dims,
        saved: context.saved,
    };

    let grad_output = Array4::from_elem(output.dim(), 1.0);
    let err = dispatcher.backward(&mut forged, &grad_output).unwrap_err();
    assert!(matches!(err, AttentionError::InvalidContext(_)));
    // routing failed fast: the saved state was not consumed
    assert!(!forged.is_consumed());
}

#[test]
fn test_grad_output_shape_is_validated() {
    let dispatcher = AttentionDispatcher::portable();
    let inputs = small_inputs();
    let (_, mut context) = dispatcher.forward(&inputs).unwrap();

    let wrong = Array4::<f32>::zeros((1, 2, 4, 7));
    let err = dispatcher.backward(&mut context, &wrong).unwrap_err();
    assert!(matches!(err, AttentionError::ShapeMismatch { .. }));
    assert!(!context.is_consumed());
}

#[test]
fn test_forward_validates_shapes_before_dispatch() {
    let dispatcher = AttentionDispatcher::portable();

    // key head dim differs from query head dim
    let inputs = AttentionInputs::new(
        Array4::<f32>::zeros((1, 2, 4, 8)),
        Array4::<f32>::zeros((1, 2, 5, 9)),
        Array4::<f32>::zeros((1, 2, 5, 6)),
    );
    assert!(matches!(
        dispatcher.forward(&inputs).unwrap_err(),
        AttentionError::ShapeMismatch { .. }
    ));

    // value sequence length differs from key sequence length
    let inputs = AttentionInputs::new(
        Array4::<f32>::zeros((1, 2, 4, 8)),
        Array4::<f32>::zeros((1, 2, 5, 8)),
        Array4::<f32>::zeros((1, 2, 6, 6)),
    );
    assert!(matches!(
        dispatcher.forward(&inputs).unwrap_err(),
        AttentionError::ShapeMismatch { .. }
    ));

    // bias not broadcastable to the score shape
    let inputs = AttentionInputs::new(
        Array4::<f32>::zeros((1, 2, 4, 8)),
        Array4::<f32>::zeros((1, 2, 5, 8)),
        Array4::<f32>::zeros((1, 2, 5, 6)),
    )
    .with_bias(Array4::<f32>::zeros((1, 2, 3, 5)));
    assert!(matches!(
        dispatcher.forward(&inputs).unwrap_err(),
        AttentionError::ShapeMismatch { .. }
    ));
}

#[test]
fn test_contexts_are_independent() {
    let dispatcher = AttentionDispatcher::portable();
    let inputs = small_inputs();

    let (output_a, mut context_a) = dispatcher.forward(&inputs).unwrap();
    let (_, mut context_b) = dispatcher.forward(&inputs).unwrap();

    let grad_output = Array4::from_elem(output_a.dim(), 1.0);
    dispatcher.backward(&mut context_a, &grad_output).unwrap();
    // consuming one context leaves the other usable
    dispatcher.backward(&mut context_b, &grad_output).unwrap();
}

#[test]
fn test_with_probe_matches_probe_answer() {
    let probe = CapabilityProbe::new();
    let dispatcher = AttentionDispatcher::with_probe(&probe);
    if probe.available() {
        assert_eq!(dispatcher.backend(), Backend::Fused);
    } else {
        assert_eq!(dispatcher.backend(), Backend::Portable);
    }

    // the probe answer is stable, so a second dispatcher picks the same backend
    let again = AttentionDispatcher::with_probe(&probe);
    assert_eq!(again.backend(), dispatcher.backend());
}
