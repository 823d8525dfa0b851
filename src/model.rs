//! Compiled-model capability traits and the native model instance.
//!
//! The statistical model itself is an opaque compiled unit: the bridge only
//! needs a way to instantiate it against a [`VarContext`] and to evaluate
//! the resulting log density with gradient. Evaluation errors are split
//! into recoverable ones, which the sampler treats as rejections, and
//! unrecoverable ones, which end the run.

use std::sync::Arc;

use thiserror::Error;

use crate::var_context::{ContextError, VarContext};

#[derive(Error, Debug)]
pub enum DensityError {
    /// The density evaluated to NaN or infinity at this point.
    #[error("log density is not finite at the evaluated point")]
    NonFinite,
    /// The point lies outside the support of the model.
    #[error("parameter out of support: {0}")]
    OutOfSupport(&'static str),
    /// The model object cannot be evaluated at all anymore.
    #[error("model evaluation failed: {0}")]
    Broken(String),
}

impl DensityError {
    /// Recoverable errors reject the proposal and let the chain continue;
    /// unrecoverable ones stop sampling.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DensityError::Broken(_))
    }
}

/// A log density with gradient over a fixed-order parameter vector.
pub trait Density: Send + Sync {
    /// Number of parameters; equals `param_names().len()`.
    fn dim(&self) -> usize;

    /// Parameter names in the model-defined draw order.
    fn param_names(&self) -> &[String];

    /// Evaluate the unnormalized log density and write the gradient.
    fn logp_gradient(&self, position: &[f64], gradient: &mut [f64])
        -> Result<f64, DensityError>;
}

/// An opaque compiled model, instantiable against a dataset.
pub trait CompiledModel: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Bind the unit to a context, producing an evaluable density.
    ///
    /// All data validation specific to the model (required variables,
    /// value ranges) happens here, before anything is registered.
    fn instantiate(&self, context: &VarContext) -> Result<Box<dyn Density>, ContextError>;
}

/// A compiled unit bound to one context and seed; the object a registry
/// handle refers to.
pub struct ModelInstance {
    unit_name: String,
    density: Box<dyn Density>,
    context: Arc<VarContext>,
    seed: u64,
}

impl std::fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInstance")
            .field("unit_name", &self.unit_name)
            .field("context", &self.context)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

impl ModelInstance {
    pub fn new(
        unit: &dyn CompiledModel,
        context: Arc<VarContext>,
        seed: u64,
    ) -> Result<ModelInstance, ContextError> {
        let density = unit.instantiate(&context)?;
        Ok(ModelInstance {
            unit_name: unit.name().to_string(),
            density,
            context,
            seed,
        })
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    pub fn dim(&self) -> usize {
        self.density.dim()
    }

    pub fn param_names(&self) -> &[String] {
        self.density.param_names()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn context(&self) -> &VarContext {
        &self.context
    }

    pub fn density(&self) -> &dyn Density {
        self.density.as_ref()
    }

    /// Starting point for a chain: context-bound values win over the model
    /// default of zero, parameter by parameter.
    pub fn initial_position(&self) -> Vec<f64> {
        self.param_names()
            .iter()
            .map(|name| self.context.scalar(name).unwrap_or(0.0))
            .collect()
    }
}

/// iid normal observations `y` with unknown mean and known scale.
///
/// The scale is read from the context variable `sigma` when present and
/// defaults to one.
pub struct NormalMeanUnit;

impl CompiledModel for NormalMeanUnit {
    fn name(&self) -> &str {
        "normal_mean"
    }

    fn instantiate(&self, context: &VarContext) -> Result<Box<dyn Density>, ContextError> {
        let y = context.require_reals("y")?.into_owned();
        let sigma = context.scalar("sigma").unwrap_or(1.0);
        if sigma <= 0.0 {
            return Err(ContextError::Invalid {
                name: "sigma".to_string(),
                reason: "scale must be positive",
            });
        }
        Ok(Box::new(NormalMeanDensity {
            y,
            inv_var: sigma.powi(-2),
            names: vec!["mu".to_string()],
        }))
    }
}

struct NormalMeanDensity {
    y: Vec<f64>,
    inv_var: f64,
    names: Vec<String>,
}

impl Density for NormalMeanDensity {
    fn dim(&self) -> usize {
        1
    }

    fn param_names(&self) -> &[String] {
        &self.names
    }

    fn logp_gradient(
        &self,
        position: &[f64],
        gradient: &mut [f64],
    ) -> Result<f64, DensityError> {
        let mu = position[0];
        let mut logp = 0.0;
        let mut score = 0.0;
        for &y in self.y.iter() {
            let diff = y - mu;
            logp -= 0.5 * self.inv_var * diff * diff;
            score += self.inv_var * diff;
        }
        gradient[0] = score;
        if !logp.is_finite() {
            return Err(DensityError::NonFinite);
        }
        Ok(logp)
    }
}

/// iid normal observations `y` with unknown location and scale.
///
/// The scale parameter is sampled on its natural domain; proposals with a
/// non-positive scale fail recoverably, which the sampler turns into
/// rejections.
pub struct LocationScaleUnit;

impl CompiledModel for LocationScaleUnit {
    fn name(&self) -> &str {
        "location_scale"
    }

    fn instantiate(&self, context: &VarContext) -> Result<Box<dyn Density>, ContextError> {
        let y = context.require_reals("y")?.into_owned();
        Ok(Box::new(LocationScaleDensity {
            y,
            names: vec!["mu".to_string(), "sigma".to_string()],
        }))
    }
}

struct LocationScaleDensity {
    y: Vec<f64>,
    names: Vec<String>,
}

impl Density for LocationScaleDensity {
    fn dim(&self) -> usize {
        2
    }

    fn param_names(&self) -> &[String] {
        &self.names
    }

    fn logp_gradient(
        &self,
        position: &[f64],
        gradient: &mut [f64],
    ) -> Result<f64, DensityError> {
        let (mu, sigma) = (position[0], position[1]);
        if sigma <= 0.0 {
            return Err(DensityError::OutOfSupport("scale must be positive"));
        }
        let n = self.y.len() as f64;
        let inv_var = sigma.powi(-2);

        let mut sum_sq = 0.0;
        let mut score = 0.0;
        for &y in self.y.iter() {
            let diff = y - mu;
            sum_sq += diff * diff;
            score += diff;
        }

        let logp = -n * sigma.ln() - 0.5 * inv_var * sum_sq;
        gradient[0] = inv_var * score;
        gradient[1] = -n / sigma + sum_sq / (sigma * sigma * sigma);
        if !logp.is_finite() {
            return Err(DensityError::NonFinite);
        }
        Ok(logp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::var_context::VarValues;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    fn context(triples: Vec<(&str, Vec<f64>, Vec<usize>)>) -> Arc<VarContext> {
        Arc::new(
            VarContext::build(triples.into_iter().map(|(name, values, dims)| {
                (name.to_string(), VarValues::Real(values.into()), dims)
            }))
            .unwrap(),
        )
    }

    #[test]
    fn normal_mean_gradient_matches_closed_form() {
        let ctx = context(vec![("y", vec![1.0, 2.0, 3.0], vec![3])]);
        let instance = ModelInstance::new(&NormalMeanUnit, ctx, 0).unwrap();

        let mut gradient = [0.0];
        let logp = instance
            .density()
            .logp_gradient(&[0.0], &mut gradient)
            .unwrap();
        assert_relative_eq!(logp, -7.0);
        assert_relative_eq!(gradient[0], 6.0);
    }

    #[test]
    fn missing_data_fails_construction() {
        let ctx = context(vec![]);
        let err = ModelInstance::new(&NormalMeanUnit, ctx, 0).unwrap_err();
        assert_eq!(err, ContextError::MissingVariable("y".to_string()));
    }

    #[test]
    fn location_scale_rejects_non_positive_scale() {
        let ctx = context(vec![("y", vec![0.5], vec![1])]);
        let instance = ModelInstance::new(&LocationScaleUnit, ctx, 0).unwrap();

        let mut gradient = [0.0, 0.0];
        let err = instance
            .density()
            .logp_gradient(&[0.0, -1.0], &mut gradient)
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn initial_position_prefers_context_values() {
        let ctx = context(vec![
            ("y", vec![0.5], vec![1]),
            ("mu", vec![1.5], vec![1]),
            ("sigma", vec![2.0], vec![1]),
        ]);
        let instance = ModelInstance::new(&LocationScaleUnit, ctx, 0).unwrap();
        assert_eq!(instance.initial_position(), vec![1.5, 2.0]);
    }
}
