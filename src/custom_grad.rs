//! Functions with a hand-written backward rule.
//!
//! [`FnWithCustomGrad`] runs an ordinary forward computation, then fences
//! its outputs off behind a single tape entry whose backward rule is the
//! user's [`CustomGradient::backward`]. Automatic differentiation never
//! looks inside the forward pass: gradients for the inputs and for every
//! variable the forward pass created come only from the custom rule.
//!
//! # Example
//!
//! ```
//! use convgate::autograd::{clear_graph, get_grad, Tensor};
//! use convgate::custom_grad::{BackwardContext, CustomGradient, CustomGrads, FnWithCustomGrad, Outputs};
//! use convgate::error::Result;
//! use convgate::nn::{Scope, VarStore};
//!
//! /// Identity whose gradient is always 3.
//! struct StraightThrough;
//!
//! impl CustomGradient for StraightThrough {
//!     fn forward(&self, inputs: &[Tensor], _scope: &Scope) -> Result<Outputs> {
//!         Ok(Outputs::Single(inputs[0].clone()))
//!     }
//!
//!     fn backward(&self, ctx: &BackwardContext<'_>) -> CustomGrads {
//!         CustomGrads::inputs_only(vec![Tensor::full(ctx.inputs[0].shape(), 3.0)])
//!     }
//! }
//!
//! clear_graph();
//! let store = VarStore::new();
//! let x = Tensor::from_slice(&[1.0, 2.0]).requires_grad();
//! let y = FnWithCustomGrad::new(StraightThrough)
//!     .call(&store.root(), &[x.clone()])?
//!     .into_single();
//! y.sum().backward();
//! assert_eq!(get_grad(x.id()).unwrap().data(), &[3.0, 3.0]);
//! # Ok::<(), convgate::error::ConvGateError>(())
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::autograd::{is_grad_enabled, with_graph, GradFn, Tensor};
use crate::error::Result;
use crate::nn::Scope;

/// Default scope name of every wrapped call.
pub const SCOPE_NAME: &str = "fn_with_custom_grad";

/// Result of a forward pass, keeping the shape the caller returned.
#[derive(Debug, Clone)]
pub enum Outputs {
    /// One tensor
    Single(Tensor),
    /// Several tensors, in order
    Multiple(Vec<Tensor>),
}

impl Outputs {
    /// Number of tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multiple(v) => v.len(),
        }
    }

    /// Whether there are no tensors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All tensors as a list.
    #[must_use]
    pub fn into_vec(self) -> Vec<Tensor> {
        match self {
            Self::Single(t) => vec![t],
            Self::Multiple(v) => v,
        }
    }

    /// The first tensor.
    ///
    /// # Panics
    ///
    /// Panics on an empty `Multiple`.
    #[must_use]
    pub fn into_single(self) -> Tensor {
        match self {
            Self::Single(t) => t,
            Self::Multiple(v) => v
                .into_iter()
                .next()
                .expect("into_single() called on empty outputs"),
        }
    }

    /// Rebuild outputs of the same kind from `tensors`.
    fn same_kind(&self, mut tensors: Vec<Tensor>) -> Self {
        match self {
            Self::Single(_) if tensors.len() == 1 => Self::Single(tensors.remove(0)),
            _ => Self::Multiple(tensors),
        }
    }
}

impl From<Tensor> for Outputs {
    fn from(t: Tensor) -> Self {
        Self::Single(t)
    }
}

impl From<Vec<Tensor>> for Outputs {
    fn from(v: Vec<Tensor>) -> Self {
        Self::Multiple(v)
    }
}

/// Everything a backward rule may look at.
#[derive(Debug, Clone, Copy)]
pub struct BackwardContext<'a> {
    /// Inputs of the forward call
    pub inputs: &'a [Tensor],
    /// Variables captured from the forward scope, in creation order
    pub params: &'a [Tensor],
    /// Forward outputs
    pub outputs: &'a [Tensor],
    /// Gradient of the loss with respect to each output
    pub output_grads: &'a [Tensor],
}

/// Gradients produced by a backward rule.
#[derive(Debug, Clone, Default)]
pub struct CustomGrads {
    /// One per input, same shapes
    pub inputs: Vec<Tensor>,
    /// One per captured variable, same shapes
    pub params: Vec<Tensor>,
}

impl CustomGrads {
    /// Gradients for a forward pass that created no variables.
    #[must_use]
    pub fn inputs_only(inputs: Vec<Tensor>) -> Self {
        Self {
            inputs,
            params: Vec::new(),
        }
    }
}

/// A forward computation paired with its own backward rule.
pub trait CustomGradient: Send + Sync {
    /// Run the forward pass. Variables created through `scope` are
    /// captured and later handed to [`backward`](Self::backward).
    ///
    /// # Errors
    ///
    /// Whatever the forward computation reports.
    fn forward(&self, inputs: &[Tensor], scope: &Scope) -> Result<Outputs>;

    /// Gradients for the inputs and captured variables.
    ///
    /// Runs inside the backward pass with gradient recording off. Tensor
    /// operations are fine, but the computation graph itself is borrowed.
    ///
    /// # Panics
    ///
    /// Calling [`get_grad`](crate::autograd::get_grad),
    /// [`clear_graph`](crate::autograd::clear_graph) or
    /// [`Tensor::backward`] from here panics, since the thread-local graph
    /// is already mutably borrowed. Returning the wrong number of gradients,
    /// or a gradient whose shape differs from its tensor, also panics.
    fn backward(&self, ctx: &BackwardContext<'_>) -> CustomGrads;
}

/// Options of [`FnWithCustomGrad`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomGradConfig {
    /// Capture non-trainable variables as well
    pub use_global_vars: bool,
    /// Included in the op name ahead of a process-wide counter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl CustomGradConfig {
    #[must_use]
    pub fn with_use_global_vars(mut self, use_global_vars: bool) -> Self {
        self.use_global_vars = use_global_vars;
        self
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

fn next_op_name(key: Option<&str>) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    match key {
        Some(k) => format!("identity_custom_grad_{k}_{n}"),
        None => format!("identity_custom_grad_{n}"),
    }
}

struct CustomGradBackward {
    op_name: String,
    rule: Arc<dyn CustomGradient>,
    inputs: Vec<Tensor>,
    params: Vec<Tensor>,
    outputs: Vec<Tensor>,
}

impl GradFn for CustomGradBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        assert_eq!(
            self.outputs.len(),
            grad_outputs.len(),
            "{}: {} forward outputs but {} output gradients",
            self.op_name,
            self.outputs.len(),
            grad_outputs.len()
        );
        trace!(op = %self.op_name, outputs = grad_outputs.len(), "custom backward");

        let ctx = BackwardContext {
            inputs: &self.inputs,
            params: &self.params,
            outputs: &self.outputs,
            output_grads: grad_outputs,
        };
        let grads = self.rule.backward(&ctx);

        assert_eq!(
            grads.inputs.len(),
            self.inputs.len(),
            "{}: backward returned {} input gradients for {} inputs",
            self.op_name,
            grads.inputs.len(),
            self.inputs.len()
        );
        assert_eq!(
            grads.params.len(),
            self.params.len(),
            "{}: backward returned {} variable gradients for {} variables",
            self.op_name,
            grads.params.len(),
            self.params.len()
        );
        for (g, t) in grads.inputs.iter().chain(&grads.params).zip(self.inputs.iter().chain(&self.params)) {
            assert_eq!(
                g.shape(),
                t.shape(),
                "{}: gradient shape does not match its tensor",
                self.op_name
            );
        }

        grads.inputs.into_iter().chain(grads.params).collect()
    }

    fn name(&self) -> &'static str {
        "CustomGradBackward"
    }
}

/// Wraps a [`CustomGradient`] so its backward rule replaces automatic
/// differentiation of the forward pass.
#[derive(Clone)]
pub struct FnWithCustomGrad {
    rule: Arc<dyn CustomGradient>,
    override_grad: bool,
    config: CustomGradConfig,
}

impl FnWithCustomGrad {
    /// Wrap `f`, overriding its gradient with `f.backward`.
    pub fn new(f: impl CustomGradient + 'static) -> Self {
        Self {
            rule: Arc::new(f),
            override_grad: true,
            config: CustomGradConfig::default(),
        }
    }

    /// Wrap `f` without touching differentiation: `call` returns the
    /// forward result as is and `f.backward` is never used.
    pub fn without_override(f: impl CustomGradient + 'static) -> Self {
        Self {
            override_grad: false,
            ..Self::new(f)
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: CustomGradConfig) -> Self {
        self.config = config;
        self
    }

    /// Options in use.
    #[must_use]
    pub fn config(&self) -> &CustomGradConfig {
        &self.config
    }

    /// Run the forward pass in a fresh `fn_with_custom_grad` scope under
    /// `scope` and, when overriding, attach the custom backward rule.
    ///
    /// Returned tensors carry the forward values; they are new graph
    /// nodes whose only recorded dependency is the custom rule over
    /// `inputs` and the captured variables.
    ///
    /// # Errors
    ///
    /// Whatever the forward pass reports.
    pub fn call(&self, scope: &Scope, inputs: &[Tensor]) -> Result<Outputs> {
        let fn_scope = scope.sub_unique(SCOPE_NAME);
        let outputs = self.rule.forward(inputs, &fn_scope)?;
        if !self.override_grad || outputs.is_empty() {
            return Ok(outputs);
        }

        let variables = if self.config.use_global_vars {
            fn_scope.global_variables()
        } else {
            fn_scope.trainable_variables()
        };
        let params: Vec<Tensor> = variables.iter().map(|v| v.value().clone()).collect();

        let forward: Vec<Tensor> = outputs.clone().into_vec();
        let mut wrapped: Vec<Tensor> = forward
            .iter()
            .map(|t| Tensor::from_vec(t.data().to_vec(), t.shape()))
            .collect();

        let op_name = next_op_name(self.config.key.as_deref());
        let tracked =
            is_grad_enabled() && inputs.iter().chain(&params).any(Tensor::requires_grad_enabled);
        debug!(
            op = %op_name,
            scope = %fn_scope.path(),
            inputs = inputs.len(),
            params = params.len(),
            outputs = wrapped.len(),
            tracked,
            "registering custom gradient"
        );

        if tracked {
            let input_ids = inputs.iter().chain(&params).map(Tensor::id).collect();
            let grad_fn: Arc<dyn GradFn> = Arc::new(CustomGradBackward {
                op_name,
                rule: Arc::clone(&self.rule),
                inputs: inputs.to_vec(),
                params: params.clone(),
                outputs: forward,
            });
            for t in &mut wrapped {
                t.requires_grad_(true);
                t.set_grad_fn(Arc::clone(&grad_fn));
            }
            with_graph(|graph| {
                for t in inputs.iter().chain(&params) {
                    graph.register_tensor(t.clone());
                }
                graph.record_many(&wrapped, grad_fn, input_ids);
            });
        }

        Ok(outputs.same_kind(wrapped))
    }
}

impl fmt::Debug for FnWithCustomGrad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnWithCustomGrad")
            .field("override_grad", &self.override_grad)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{clear_graph, get_grad, no_grad, tape_len};
    use crate::nn::{Initializer, VarStore, VariableConfig};

    /// y = x * w with a backward rule that reports 2 * dy for x and 0 for w.
    struct ScaledByVariable;

    impl CustomGradient for ScaledByVariable {
        fn forward(&self, inputs: &[Tensor], scope: &Scope) -> Result<Outputs> {
            let w = scope.get_variable(
                "w",
                inputs[0].shape(),
                &VariableConfig::new(Initializer::Constant { value: 5.0 }),
            )?;
            Ok(inputs[0].mul(&w).into())
        }

        fn backward(&self, ctx: &BackwardContext<'_>) -> CustomGrads {
            CustomGrads {
                inputs: vec![ctx.output_grads[0].mul_scalar(2.0)],
                params: vec![Tensor::zeros_like(&ctx.params[0])],
            }
        }
    }

    #[test]
    fn test_outputs_kind_preserved() {
        let single = Outputs::Single(Tensor::zeros(&[1]));
        assert!(matches!(
            single.same_kind(vec![Tensor::ones(&[1])]),
            Outputs::Single(_)
        ));
        let multi = Outputs::Multiple(vec![Tensor::zeros(&[1])]);
        assert!(matches!(
            multi.same_kind(vec![Tensor::ones(&[1])]),
            Outputs::Multiple(_)
        ));
    }

    #[test]
    fn test_op_names() {
        let k1 = next_op_name(Some("k"));
        let k2 = next_op_name(Some("k"));
        assert!(k1.starts_with("identity_custom_grad_k_"));
        assert_ne!(k1, k2);
        let a = next_op_name(None);
        let b = next_op_name(None);
        assert_ne!(a, b);
        assert!(a.starts_with("identity_custom_grad_"));
    }

    #[test]
    fn test_override_replaces_gradients() {
        clear_graph();
        let store = VarStore::new();
        let x = Tensor::from_slice(&[1.0, -1.0]).requires_grad();
        let y = FnWithCustomGrad::new(ScaledByVariable)
            .call(&store.root(), &[x.clone()])
            .expect("call")
            .into_single();

        assert_eq!(y.data(), &[5.0, -5.0]);
        assert_eq!(y.grad_fn_name(), Some("CustomGradBackward"));
        y.sum().backward();

        assert_eq!(get_grad(x.id()).expect("x grad").data(), &[2.0, 2.0]);
        let w = store.get("fn_with_custom_grad/w").expect("w");
        assert_eq!(get_grad(w.id()).expect("w grad").data(), &[0.0, 0.0]);
    }

    #[test]
    fn test_untracked_inputs_skip_recording() {
        clear_graph();
        let store = VarStore::new();
        let cfg = CustomGradConfig::default();
        let f = FnWithCustomGrad::new(ScaledByVariable).with_config(cfg);
        let before = tape_len();
        let y = no_grad(|| f.call(&store.root(), &[Tensor::ones(&[2])]))
            .expect("call")
            .into_single();
        assert_eq!(tape_len(), before);
        assert!(!y.requires_grad_enabled());
    }
}
