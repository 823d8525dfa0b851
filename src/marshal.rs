//! Primitive converters between host terms and native values.
//!
//! Every boundary entry point goes through this layer before any native
//! object is touched. Decoders return [`ArgumentError`] on mismatch instead
//! of panicking, so a malformed call can never corrupt host state.

use thiserror::Error;

use crate::term::Term;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArgumentError {
    #[error("expected {expected} arguments, got {got}")]
    Arity { expected: usize, got: usize },
    #[error("expected {expected}, got {found}")]
    Type {
        expected: &'static str,
        found: &'static str,
    },
    #[error("expected a non-negative integer, got {0}")]
    Negative(i64),
    #[error("expected a tuple of {expected} elements, got {got}")]
    TupleArity { expected: usize, got: usize },
    #[error("unknown option {0:?}")]
    UnknownOption(String),
}

pub fn expect_arity(argv: &[Term], expected: usize) -> Result<(), ArgumentError> {
    if argv.len() == expected {
        Ok(())
    } else {
        Err(ArgumentError::Arity {
            expected,
            got: argv.len(),
        })
    }
}

pub fn decode_int(term: &Term) -> Result<i64, ArgumentError> {
    match term {
        Term::Int(value) => Ok(*value),
        other => Err(ArgumentError::Type {
            expected: "integer",
            found: other.kind_name(),
        }),
    }
}

/// Decode a non-negative integer, the shape of all count-like arguments.
pub fn decode_uint(term: &Term) -> Result<u64, ArgumentError> {
    let value = decode_int(term)?;
    u64::try_from(value).map_err(|_| ArgumentError::Negative(value))
}

/// Decode a float, coercing integer terms the way the host's numeric
/// literals do.
pub fn decode_f64(term: &Term) -> Result<f64, ArgumentError> {
    match term {
        Term::Float(value) => Ok(*value),
        Term::Int(value) => Ok(*value as f64),
        other => Err(ArgumentError::Type {
            expected: "number",
            found: other.kind_name(),
        }),
    }
}

pub fn decode_atom(term: &Term) -> Result<&str, ArgumentError> {
    match term {
        Term::Atom(name) => Ok(name),
        other => Err(ArgumentError::Type {
            expected: "atom",
            found: other.kind_name(),
        }),
    }
}

/// Accept an atom or string for name-like arguments.
pub fn decode_name(term: &Term) -> Result<&str, ArgumentError> {
    match term {
        Term::Atom(name) | Term::Str(name) => Ok(name),
        other => Err(ArgumentError::Type {
            expected: "atom or string",
            found: other.kind_name(),
        }),
    }
}

pub fn decode_list(term: &Term) -> Result<&[Term], ArgumentError> {
    match term {
        Term::List(items) => Ok(items),
        other => Err(ArgumentError::Type {
            expected: "list",
            found: other.kind_name(),
        }),
    }
}

pub fn decode_tuple(term: &Term, expected: usize) -> Result<&[Term], ArgumentError> {
    match term {
        Term::Tuple(items) if items.len() == expected => Ok(items),
        Term::Tuple(items) => Err(ArgumentError::TupleArity {
            expected,
            got: items.len(),
        }),
        other => Err(ArgumentError::Type {
            expected: "tuple",
            found: other.kind_name(),
        }),
    }
}

pub fn decode_list_of<T>(
    term: &Term,
    elem: impl Fn(&Term) -> Result<T, ArgumentError>,
) -> Result<Vec<T>, ArgumentError> {
    decode_list(term)?.iter().map(elem).collect()
}

pub fn decode_bool(term: &Term) -> Result<bool, ArgumentError> {
    match decode_atom(term)? {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ArgumentError::Type {
            expected: "boolean atom",
            found: "atom",
        }),
    }
}

pub fn encode_f64_slice(values: &[f64]) -> Term {
    Term::list(values.iter().copied().map(Term::Float))
}

pub fn encode_usize_slice(values: &[usize]) -> Term {
    Term::list(values.iter().map(|&v| Term::Int(v as i64)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn arity_is_checked_before_types() {
        let argv = [Term::int(1)];
        assert_eq!(
            expect_arity(&argv, 2),
            Err(ArgumentError::Arity {
                expected: 2,
                got: 1
            })
        );
        assert_eq!(expect_arity(&argv, 1), Ok(()));
    }

    #[test]
    fn int_decoding_rejects_other_kinds() {
        assert_eq!(decode_int(&Term::int(-3)), Ok(-3));
        assert_eq!(
            decode_int(&Term::float(1.0)),
            Err(ArgumentError::Type {
                expected: "integer",
                found: "float"
            })
        );
    }

    #[test]
    fn uint_rejects_negative() {
        assert_eq!(decode_uint(&Term::int(0)), Ok(0));
        assert_eq!(decode_uint(&Term::int(-1)), Err(ArgumentError::Negative(-1)));
    }

    #[test]
    fn floats_coerce_from_integers() {
        assert_eq!(decode_f64(&Term::int(2)), Ok(2.0));
        assert_eq!(decode_f64(&Term::float(2.5)), Ok(2.5));
    }

    #[test]
    fn list_of_numbers_round_trips() {
        let term = encode_f64_slice(&[1.0, 2.0, 3.0]);
        let values = decode_list_of(&term, decode_f64).unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }
}
