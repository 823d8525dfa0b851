use std::fmt::Display;

/// A value as the host runtime represents it at the boundary.
///
/// Entry points receive argument vectors of terms and reply with a single
/// term. The bridge never hands the host anything richer than this: native
/// objects cross the boundary as registry handles encoded in `Int`.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Int(i64),
    Float(f64),
    Atom(String),
    Str(String),
    List(Vec<Term>),
    Tuple(Vec<Term>),
}

impl Term {
    pub fn int(value: i64) -> Term {
        Term::Int(value)
    }

    pub fn float(value: f64) -> Term {
        Term::Float(value)
    }

    pub fn atom(name: impl Into<String>) -> Term {
        Term::Atom(name.into())
    }

    pub fn str(value: impl Into<String>) -> Term {
        Term::Str(value.into())
    }

    pub fn list(items: impl IntoIterator<Item = Term>) -> Term {
        Term::List(items.into_iter().collect())
    }

    pub fn tuple(items: impl IntoIterator<Item = Term>) -> Term {
        Term::Tuple(items.into_iter().collect())
    }

    /// The host-side success reply `{ok, Value}`.
    pub fn ok(value: Term) -> Term {
        Term::tuple([Term::atom("ok"), value])
    }

    /// The host-side failure reply `{error, {Kind, Message}}`.
    pub fn error(kind: &str, message: impl Display) -> Term {
        Term::tuple([
            Term::atom("error"),
            Term::tuple([Term::atom(kind), Term::str(message.to_string())]),
        ])
    }

    /// Name of the variant, for diagnostics in decode failures.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Term::Int(_) => "integer",
            Term::Float(_) => "float",
            Term::Atom(_) => "atom",
            Term::Str(_) => "string",
            Term::List(_) => "list",
            Term::Tuple(_) => "tuple",
        }
    }

    pub fn is_ok_reply(&self) -> bool {
        matches!(self, Term::Tuple(items) if items.first() == Some(&Term::atom("ok")))
    }

    pub fn is_error_reply(&self) -> bool {
        matches!(self, Term::Tuple(items) if items.first() == Some(&Term::atom("error")))
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Term {
        Term::Int(value)
    }
}

impl From<f64> for Term {
    fn from(value: f64) -> Term {
        Term::Float(value)
    }
}
