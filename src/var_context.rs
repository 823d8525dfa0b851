//! Named, shaped numeric datasets bound to models for evaluation.
//!
//! A context is built once from flat host data plus a dimension manifest and
//! is immutable afterwards. Construction is a pure transformation: no I/O,
//! no randomness, no shared state, so independent builds may run
//! concurrently.

use std::borrow::Cow;
use std::collections::HashMap;

use itertools::Itertools;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContextError {
    #[error("duplicate variable name {0:?}")]
    DuplicateName(String),
    #[error("variable {name:?} has {got} values but dimensions {dims:?} require {expected}")]
    ShapeMismatch {
        name: String,
        dims: Vec<usize>,
        expected: usize,
        got: usize,
    },
    #[error("dimensions of variable {0:?} overflow the addressable size")]
    DimensionOverflow(String),
    #[error("variable {name:?} contains a non-finite value at index {index}")]
    NonFinite { name: String, index: usize },
    #[error("variable {0:?} is not defined in this context")]
    MissingVariable(String),
    #[error("variable {name:?} is invalid: {reason}")]
    Invalid { name: String, reason: &'static str },
}

/// Flat storage for one named variable. Integer data is kept as integers so
/// count-valued inputs survive the boundary exactly.
#[derive(Debug, Clone, PartialEq)]
pub enum VarValues {
    Real(Box<[f64]>),
    Int(Box<[i64]>),
}

impl VarValues {
    pub fn len(&self) -> usize {
        match self {
            VarValues::Real(values) => values.len(),
            VarValues::Int(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarEntry {
    name: String,
    values: VarValues,
    dims: Box<[usize]>,
}

impl VarEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &VarValues {
        &self.values
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }
}

/// An immutable mapping from variable name to a shaped array, row-major.
#[derive(Debug, Clone, Default)]
pub struct VarContext {
    entries: Vec<VarEntry>,
    index: HashMap<String, usize>,
}

impl VarContext {
    /// Build a context from `(name, flat values, dims)` triples.
    ///
    /// Validation order: name uniqueness across the whole manifest, then
    /// element count against the dimension product per name, then
    /// finiteness of every real value. The first violation aborts the
    /// build; no partial context is ever returned.
    pub fn build(
        triples: impl IntoIterator<Item = (String, VarValues, Vec<usize>)>,
    ) -> Result<VarContext, ContextError> {
        let triples = triples.into_iter().collect_vec();

        if let Some(name) = triples.iter().map(|(name, _, _)| name).duplicates().next() {
            return Err(ContextError::DuplicateName(name.clone()));
        }

        for (name, values, dims) in triples.iter() {
            let expected = dims
                .iter()
                .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                .ok_or_else(|| ContextError::DimensionOverflow(name.clone()))?;
            if values.len() != expected {
                return Err(ContextError::ShapeMismatch {
                    name: name.clone(),
                    dims: dims.clone(),
                    expected,
                    got: values.len(),
                });
            }
        }

        for (name, values, _) in triples.iter() {
            if let VarValues::Real(values) = values {
                if let Some(index) = values.iter().position(|v| !v.is_finite()) {
                    return Err(ContextError::NonFinite {
                        name: name.clone(),
                        index,
                    });
                }
            }
        }

        let mut entries = Vec::with_capacity(triples.len());
        let mut index = HashMap::with_capacity(triples.len());
        for (name, values, dims) in triples {
            index.insert(name.clone(), entries.len());
            entries.push(VarEntry {
                name,
                values,
                dims: dims.into(),
            });
        }
        Ok(VarContext { entries, index })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn entry(&self, name: &str) -> Option<&VarEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn dims(&self, name: &str) -> Option<&[usize]> {
        self.entry(name).map(|e| e.dims())
    }

    /// The values of a variable as reals, coercing integer data.
    pub fn reals(&self, name: &str) -> Option<Cow<'_, [f64]>> {
        match self.entry(name)?.values() {
            VarValues::Real(values) => Some(Cow::Borrowed(values)),
            VarValues::Int(values) => {
                Some(Cow::Owned(values.iter().map(|&v| v as f64).collect()))
            }
        }
    }

    /// A single-element variable read as a scalar.
    pub fn scalar(&self, name: &str) -> Option<f64> {
        let values = self.reals(name)?;
        (values.len() == 1).then(|| values[0])
    }

    /// Like [`VarContext::reals`] but with a typed failure for model
    /// construction paths that require the variable.
    pub fn require_reals(&self, name: &str) -> Result<Cow<'_, [f64]>, ContextError> {
        self.reals(name)
            .ok_or_else(|| ContextError::MissingVariable(name.to_string()))
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[VarEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn real(values: &[f64]) -> VarValues {
        VarValues::Real(values.to_vec().into())
    }

    #[test]
    fn shapes_round_trip() {
        let context = VarContext::build([(
            "theta".to_string(),
            real(&[1.0, 2.0, 3.0, 4.0]),
            vec![2, 2],
        )])
        .unwrap();

        assert_eq!(context.dims("theta"), Some(&[2, 2][..]));
        assert_eq!(
            context.reals("theta").unwrap().as_ref(),
            &[1.0, 2.0, 3.0, 4.0]
        );
        assert!(context.scalar("theta").is_none());
    }

    #[test]
    fn scalars_have_empty_dims() {
        let context =
            VarContext::build([("sigma".to_string(), real(&[1.5]), vec![])]).unwrap();
        assert_eq!(context.scalar("sigma"), Some(1.5));
        assert_eq!(context.dims("sigma"), Some(&[][..]));
    }

    #[test]
    fn duplicate_names_are_rejected_first() {
        // The second "a" also has a shape error; uniqueness wins.
        let err = VarContext::build([
            ("a".to_string(), real(&[1.0]), vec![]),
            ("a".to_string(), real(&[1.0, 2.0]), vec![3]),
        ])
        .unwrap_err();
        assert_eq!(err, ContextError::DuplicateName("a".to_string()));
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let err = VarContext::build([("y".to_string(), real(&[1.0, 2.0, 3.0]), vec![2, 2])])
            .unwrap_err();
        assert_eq!(
            err,
            ContextError::ShapeMismatch {
                name: "y".to_string(),
                dims: vec![2, 2],
                expected: 4,
                got: 3,
            }
        );
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let err = VarContext::build([("y".to_string(), real(&[0.0, f64::NAN]), vec![2])])
            .unwrap_err();
        assert_eq!(
            err,
            ContextError::NonFinite {
                name: "y".to_string(),
                index: 1,
            }
        );
    }

    #[test]
    fn integer_variables_coerce_to_reals() {
        let context = VarContext::build([(
            "n".to_string(),
            VarValues::Int(vec![3, 4].into()),
            vec![2],
        )])
        .unwrap();
        assert_eq!(context.reals("n").unwrap().as_ref(), &[3.0, 4.0]);
    }

    proptest! {
        #[test]
        fn valid_triples_always_build(dims in prop::collection::vec(1usize..5, 0..4)) {
            let count = dims.iter().product::<usize>();
            let values = (0..count).map(|i| i as f64).collect_vec();
            let context = VarContext::build([
                ("x".to_string(), real(&values), dims.clone()),
            ]).unwrap();
            prop_assert_eq!(context.dims("x").unwrap(), &dims[..]);
            prop_assert_eq!(context.reals("x").unwrap().len(), count);
        }

        #[test]
        fn count_mismatch_never_builds(
            dims in prop::collection::vec(1usize..5, 1..4),
            extra in 1usize..4,
        ) {
            let count = dims.iter().product::<usize>() + extra;
            let values = vec![0.0; count];
            let result = VarContext::build([
                ("x".to_string(), real(&values), dims),
            ]);
            prop_assert!(
                matches!(result, Err(ContextError::ShapeMismatch { .. })),
                "expected ShapeMismatch error"
            );
        }
    }
}
