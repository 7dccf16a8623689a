//! Named variable management.
//!
//! Layers create their learnable parameters through a [`Scope`], which
//! gives every variable a `/`-separated path and enforces explicit reuse:
//! building a layer twice under the same name fails unless the second
//! build asks to reuse, in which case the very same tensors (same
//! [`TensorId`](crate::autograd::TensorId)) are handed back.
//!
//! # Example
//!
//! ```
//! use convgate::nn::{VarStore, VariableConfig};
//!
//! let store = VarStore::new();
//! let root = store.root();
//! let layer = root.sub("dense");
//! let w = layer.get_variable("weights", &[4, 2], &VariableConfig::default()).unwrap();
//!
//! let again = root.sub("dense").reuse(true);
//! let w2 = again.get_variable("weights", &[4, 2], &VariableConfig::default()).unwrap();
//! assert_eq!(w.id(), w2.id());
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::init::Initializer;
use crate::autograd::Tensor;
use crate::error::{ConvGateError, Result};

/// Weight penalty attached to a variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regularizer {
    /// `scale * sum(|w|)`
    L1 {
        /// Penalty weight
        scale: f32,
    },
    /// `scale * sum(w^2) / 2`
    L2 {
        /// Penalty weight
        scale: f32,
    },
}

impl Regularizer {
    /// Differentiable penalty for `weights`.
    #[must_use]
    pub fn penalty(&self, weights: &Tensor) -> Tensor {
        match *self {
            Self::L1 { scale } => weights.abs().sum().mul_scalar(scale),
            Self::L2 { scale } => weights.pow(2.0).sum().mul_scalar(scale / 2.0),
        }
    }
}

/// How a variable is created on first use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableConfig {
    /// Fill scheme
    #[serde(default)]
    pub initializer: Initializer,
    /// Whether the variable takes part in gradient computation
    #[serde(default = "default_trainable")]
    pub trainable: bool,
    /// Optional penalty collected by [`VarStore::regularization_loss`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regularizer: Option<Regularizer>,
}

fn default_trainable() -> bool {
    true
}

impl Default for VariableConfig {
    fn default() -> Self {
        Self {
            initializer: Initializer::default(),
            trainable: true,
            regularizer: None,
        }
    }
}

impl VariableConfig {
    /// Config with the given initializer and defaults elsewhere.
    #[must_use]
    pub fn new(initializer: Initializer) -> Self {
        Self {
            initializer,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    #[must_use]
    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    #[must_use]
    pub fn with_regularizer(mut self, regularizer: Option<Regularizer>) -> Self {
        self.regularizer = regularizer;
        self
    }
}

/// A named variable held by a [`VarStore`].
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    value: Tensor,
    trainable: bool,
}

impl Variable {
    /// Full `/`-separated name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Whether the variable is trainable.
    #[must_use]
    pub fn trainable(&self) -> bool {
        self.trainable
    }
}

#[derive(Default)]
struct StoreInner {
    /// Variables in creation order
    vars: Vec<Variable>,
    index: HashMap<String, usize>,
    /// Next suffix for `sub_unique`, keyed by the candidate path
    counters: HashMap<String, usize>,
    regularized: Vec<(usize, Regularizer)>,
}

/// Shared store of every variable created through its scopes.
///
/// Cloning a `VarStore` yields another handle to the same store.
#[derive(Clone, Default)]
pub struct VarStore {
    inner: Rc<RefCell<StoreInner>>,
}

impl VarStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Root scope of this store (empty path, reuse off).
    #[must_use]
    pub fn root(&self) -> Scope {
        Scope {
            store: self.clone(),
            path: String::new(),
            reuse: false,
        }
    }

    /// Number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().vars.len()
    }

    /// Whether no variable has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().vars.is_empty()
    }

    /// All variables in creation order.
    #[must_use]
    pub fn variables(&self) -> Vec<Variable> {
        self.inner.borrow().vars.clone()
    }

    /// Current value of the variable called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Tensor> {
        let inner = self.inner.borrow();
        inner.index.get(name).map(|&i| inner.vars[i].value.clone())
    }

    /// Overwrite the value of an existing variable in place.
    ///
    /// The variable keeps its identity, so later lookups and reuses see
    /// the new data under the same tensor id.
    ///
    /// # Errors
    ///
    /// Returns `VariableNotFound` for an unknown name and `ShapeMismatch`
    /// when `value` has a different shape.
    pub fn assign(&self, name: &str, value: &Tensor) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let idx = *inner
            .index
            .get(name)
            .ok_or_else(|| ConvGateError::VariableNotFound {
                name: name.to_string(),
            })?;
        let var = &mut inner.vars[idx];
        if var.value.shape() != value.shape() {
            return Err(ConvGateError::ShapeMismatch {
                context: format!("assign {name}"),
                expected: var.value.shape().to_vec(),
                actual: value.shape().to_vec(),
            });
        }
        var.value.data_mut().copy_from_slice(value.data());
        Ok(())
    }

    /// Sum of every recorded regularisation penalty, or `None` when no
    /// variable carries a regularizer.
    #[must_use]
    pub fn regularization_loss(&self) -> Option<Tensor> {
        let inner = self.inner.borrow();
        inner
            .regularized
            .iter()
            .map(|&(i, reg)| reg.penalty(&inner.vars[i].value))
            .reduce(|acc, p| acc.add(&p))
    }

    fn unique_suffix(&self, candidate: &str) -> usize {
        let mut inner = self.inner.borrow_mut();
        let counter = inner.counters.entry(candidate.to_string()).or_insert(0);
        let n = *counter;
        *counter += 1;
        n
    }

    fn collect(&self, prefix: &str, trainable_only: bool) -> Vec<Variable> {
        self.inner
            .borrow()
            .vars
            .iter()
            .filter(|v| !trainable_only || v.trainable)
            .filter(|v| prefix.is_empty() || v.name.starts_with(&format!("{prefix}/")))
            .cloned()
            .collect()
    }
}

impl fmt::Debug for VarStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("VarStore")
            .field("variables", &inner.vars.len())
            .field("regularized", &inner.regularized.len())
            .finish()
    }
}

/// A position in the variable namespace.
#[derive(Debug, Clone)]
pub struct Scope {
    store: VarStore,
    path: String,
    reuse: bool,
}

impl Scope {
    fn join(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.path, name)
        }
    }

    /// Full path of this scope (empty for the root).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether variables are looked up instead of created.
    #[must_use]
    pub fn is_reusing(&self) -> bool {
        self.reuse
    }

    /// Store backing this scope.
    #[must_use]
    pub fn store(&self) -> &VarStore {
        &self.store
    }

    /// Enter the child scope `name`. Reuse is inherited.
    #[must_use]
    pub fn sub(&self, name: &str) -> Scope {
        Scope {
            store: self.store.clone(),
            path: self.join(name),
            reuse: self.reuse,
        }
    }

    /// Enter a fresh child scope: `default_name`, then `default_name_1`,
    /// `default_name_2` and so on for later calls under the same parent.
    #[must_use]
    pub fn sub_unique(&self, default_name: &str) -> Scope {
        let candidate = self.join(default_name);
        let n = self.store.unique_suffix(&candidate);
        if n == 0 {
            self.sub(default_name)
        } else {
            self.sub(&format!("{default_name}_{n}"))
        }
    }

    /// Same scope with reuse switched on. Once a scope reuses, its
    /// children keep reusing; `reuse(false)` cannot switch it back off.
    #[must_use]
    pub fn reuse(&self, reuse: bool) -> Scope {
        Scope {
            store: self.store.clone(),
            path: self.path.clone(),
            reuse: self.reuse || reuse,
        }
    }

    /// Create or look up the variable `name` in this scope.
    ///
    /// # Errors
    ///
    /// - `VariableExists` if reuse is off and the variable already exists
    /// - `VariableNotFound` if reuse is on and the variable is missing
    /// - `ShapeMismatch` if a reused variable has a different shape
    pub fn get_variable(
        &self,
        name: &str,
        shape: &[usize],
        config: &VariableConfig,
    ) -> Result<Tensor> {
        let full = self.join(name);
        let mut inner = self.store.inner.borrow_mut();

        match (inner.index.get(&full).copied(), self.reuse) {
            (Some(_), false) => Err(ConvGateError::VariableExists { name: full }),
            (None, true) => Err(ConvGateError::VariableNotFound { name: full }),
            (Some(idx), true) => {
                let value = &inner.vars[idx].value;
                if value.shape() != shape {
                    return Err(ConvGateError::ShapeMismatch {
                        context: full,
                        expected: value.shape().to_vec(),
                        actual: shape.to_vec(),
                    });
                }
                debug!(name = %full, "reusing variable");
                Ok(value.clone())
            }
            (None, false) => {
                let mut value = config.initializer.build(shape);
                value.requires_grad_(config.trainable);

                let idx = inner.vars.len();
                inner.vars.push(Variable {
                    name: full.clone(),
                    value: value.clone(),
                    trainable: config.trainable,
                });
                inner.index.insert(full.clone(), idx);
                if let Some(reg) = config.regularizer {
                    inner.regularized.push((idx, reg));
                }
                debug!(name = %full, ?shape, trainable = config.trainable, "created variable");
                Ok(value)
            }
        }
    }

    /// Overwrite the variable `name` of this scope, see [`VarStore::assign`].
    ///
    /// # Errors
    ///
    /// Same as [`VarStore::assign`].
    pub fn assign(&self, name: &str, value: &Tensor) -> Result<()> {
        self.store.assign(&self.join(name), value)
    }

    /// Trainable variables under this scope, in creation order.
    #[must_use]
    pub fn trainable_variables(&self) -> Vec<Variable> {
        self.store.collect(&self.path, true)
    }

    /// Every variable under this scope, trainable or not.
    #[must_use]
    pub fn global_variables(&self) -> Vec<Variable> {
        self.store.collect(&self.path, false)
    }
}
