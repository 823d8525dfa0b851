//! Boundary entry points: the functions the host runtime may call.
//!
//! Each entry point is a pure dispatcher: check arity, decode arguments,
//! delegate to the bridge, encode the outcome. Any native failure comes
//! back as an `{error, {Kind, Message}}` term; panics are contained here
//! and never cross into the host.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::bridge::{Bridge, BridgeError};
use crate::invoker::RunPoll;
use crate::marshal::{
    decode_atom, decode_bool, decode_f64, decode_int, decode_list, decode_list_of, decode_name,
    decode_tuple, decode_uint, encode_f64_slice, expect_arity, ArgumentError,
};
use crate::sampler::{Algorithm, Draw, LogLevel, RunStatus, RunSummary, SamplerConfig};
use crate::term::Term;
use crate::var_context::{VarContext, VarValues};

type EntryResult = Result<Term, BridgeError>;

pub struct EntryPoint {
    pub name: &'static str,
    pub arity: usize,
    run: fn(&Bridge, &[Term]) -> EntryResult,
}

/// The registration table the host loads, one row per callable function.
pub const ENTRY_POINTS: &[EntryPoint] = &[
    EntryPoint {
        name: "add",
        arity: 2,
        run: add,
    },
    EntryPoint {
        name: "new_model",
        arity: 3,
        run: new_model,
    },
    EntryPoint {
        name: "new_array_var_context",
        arity: 1,
        run: new_array_var_context,
    },
    EntryPoint {
        name: "release_var_context",
        arity: 1,
        run: release_var_context,
    },
    EntryPoint {
        name: "run_sample",
        arity: 2,
        run: run_sample,
    },
    EntryPoint {
        name: "poll_run",
        arity: 1,
        run: poll_run,
    },
    EntryPoint {
        name: "interrupt_run",
        arity: 1,
        run: interrupt_run,
    },
    EntryPoint {
        name: "collect_run",
        arity: 1,
        run: collect_run,
    },
    EntryPoint {
        name: "run_logs",
        arity: 1,
        run: run_logs,
    },
    EntryPoint {
        name: "release_model",
        arity: 1,
        run: release_model,
    },
];

/// Invoke a named entry point.
///
/// Arity is enforced before anything native is touched, and the closure is
/// unwind-guarded so a bug in the bridge shows up as an `internal` error
/// term rather than a host crash.
pub fn dispatch(bridge: &Bridge, name: &str, argv: &[Term]) -> Term {
    let Some(entry) = ENTRY_POINTS.iter().find(|entry| entry.name == name) else {
        return Term::error("undefined", format!("no entry point named {name:?}"));
    };
    if let Err(err) = expect_arity(argv, entry.arity) {
        return Term::error("bad_argument", err);
    }
    match catch_unwind(AssertUnwindSafe(|| (entry.run)(bridge, argv))) {
        Ok(Ok(value)) => Term::ok(value),
        Ok(Err(err)) => Term::error(err.kind(), err),
        Err(_) => Term::error("internal", "native panic in entry point"),
    }
}

fn add(_bridge: &Bridge, argv: &[Term]) -> EntryResult {
    let a = decode_int(&argv[0])?;
    let b = decode_int(&argv[1])?;
    Ok(Term::int(a.wrapping_add(b)))
}

fn new_model(bridge: &Bridge, argv: &[Term]) -> EntryResult {
    let unit_name = decode_name(&argv[0])?;
    let context = match &argv[1] {
        // An integer is a handle to a previously built context.
        Term::Int(_) => bridge.var_context(decode_uint(&argv[1])?)?,
        inline => Arc::new(VarContext::build(decode_context_entries(inline)?)?),
    };
    let seed = decode_uint(&argv[2])?;
    let handle = bridge.new_model(unit_name, context, seed)?;
    Ok(Term::int(handle as i64))
}

fn new_array_var_context(bridge: &Bridge, argv: &[Term]) -> EntryResult {
    let entries = decode_context_entries(&argv[0])?;
    let handle = bridge.new_var_context(entries)?;
    Ok(Term::int(handle as i64))
}

fn release_var_context(bridge: &Bridge, argv: &[Term]) -> EntryResult {
    bridge.release_var_context(decode_uint(&argv[0])?)?;
    Ok(Term::atom("released"))
}

fn run_sample(bridge: &Bridge, argv: &[Term]) -> EntryResult {
    let handle = decode_uint(&argv[0])?;
    let config = decode_config(&argv[1])?;
    let run_id = bridge.run_sample(handle, config)?;
    Ok(Term::int(run_id as i64))
}

fn poll_run(bridge: &Bridge, argv: &[Term]) -> EntryResult {
    match bridge.poll_run(decode_uint(&argv[0])?)? {
        RunPoll::Running(progress) => Ok(Term::tuple([
            Term::atom("running"),
            Term::atom(progress.phase.as_str()),
            Term::int(progress.iteration as i64),
            Term::int(progress.total as i64),
        ])),
        RunPoll::Finished(status) => Ok(Term::tuple([
            Term::atom("finished"),
            encode_status(&status),
        ])),
    }
}

fn interrupt_run(bridge: &Bridge, argv: &[Term]) -> EntryResult {
    bridge.interrupt_run(decode_uint(&argv[0])?)?;
    Ok(Term::atom("interrupted"))
}

fn collect_run(bridge: &Bridge, argv: &[Term]) -> EntryResult {
    let summary = bridge.collect_run(decode_uint(&argv[0])?)?;
    Ok(encode_summary(&summary))
}

fn run_logs(bridge: &Bridge, argv: &[Term]) -> EntryResult {
    let messages = bridge.run_logs(decode_uint(&argv[0])?)?;
    Ok(Term::list(messages.into_iter().map(|(level, text)| {
        Term::tuple([Term::atom(level_atom(level)), Term::str(text)])
    })))
}

fn release_model(bridge: &Bridge, argv: &[Term]) -> EntryResult {
    bridge.release_model(decode_uint(&argv[0])?)?;
    Ok(Term::atom("released"))
}

fn decode_context_entries(
    term: &Term,
) -> Result<Vec<(String, VarValues, Vec<usize>)>, ArgumentError> {
    decode_list_of(term, |item| {
        let triple = decode_tuple(item, 3)?;
        let name = decode_name(&triple[0])?.to_string();
        let values = decode_values(&triple[1])?;
        let dims = decode_list_of(&triple[2], |dim| decode_uint(dim).map(|v| v as usize))?;
        Ok((name, values, dims))
    })
}

/// A list of all-integer terms stays integer valued; any float makes the
/// whole variable real.
fn decode_values(term: &Term) -> Result<VarValues, ArgumentError> {
    let items = decode_list(term)?;
    if items.iter().all(|item| matches!(item, Term::Int(_))) {
        let ints: Vec<i64> = items.iter().map(decode_int).collect::<Result<_, _>>()?;
        Ok(VarValues::Int(ints.into()))
    } else {
        let reals: Vec<f64> = items.iter().map(decode_f64).collect::<Result<_, _>>()?;
        Ok(VarValues::Real(reals.into()))
    }
}

fn decode_config(term: &Term) -> Result<SamplerConfig, ArgumentError> {
    let mut config = SamplerConfig::default();
    for item in decode_list(term)? {
        let pair = decode_tuple(item, 2)?;
        let value = &pair[1];
        match decode_atom(&pair[0])? {
            "algorithm" => {
                config.algorithm = match decode_atom(value)? {
                    "fixed_param" => Algorithm::FixedParam,
                    "nuts" => Algorithm::Nuts,
                    other => return Err(ArgumentError::UnknownOption(other.to_string())),
                }
            }
            "seed" => config.seed = Some(decode_uint(value)?),
            "num_warmup" => config.num_warmup = decode_uint(value)?,
            "num_samples" => config.num_draws = decode_uint(value)?,
            "thin" => config.thin = decode_uint(value)?.max(1),
            "refresh" => config.refresh = decode_uint(value)?,
            "max_depth" => config.max_depth = decode_uint(value)?,
            "max_energy_error" => config.max_energy_error = decode_f64(value)?,
            "adapt_step_size" => config.adapt_step_size = decode_bool(value)?,
            "adapt_mass_matrix" => config.adapt_mass_matrix = decode_bool(value)?,
            other => return Err(ArgumentError::UnknownOption(other.to_string())),
        }
    }
    Ok(config)
}

fn level_atom(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warning",
        LogLevel::Error => "error",
    }
}

fn bool_atom(value: bool) -> Term {
    Term::atom(if value { "true" } else { "false" })
}

fn encode_status(status: &RunStatus) -> Term {
    match status {
        RunStatus::Failed(message) => {
            Term::tuple([Term::atom("failed"), Term::str(message.clone())])
        }
        other => Term::atom(other.as_str()),
    }
}

fn encode_draw(draw: &Draw) -> Term {
    let kv = |key: &str, value: Term| Term::tuple([Term::atom(key), value]);
    Term::tuple([
        encode_f64_slice(&draw.values),
        Term::list([
            kv("iteration", Term::int(draw.iteration as i64)),
            kv("warmup", bool_atom(draw.warmup)),
            kv("logp", Term::float(draw.stats.logp)),
            kv("step_size", Term::float(draw.stats.step_size)),
            kv("depth", Term::int(draw.stats.depth as i64)),
            kv("n_steps", Term::int(draw.stats.n_steps as i64)),
            kv("divergent", bool_atom(draw.stats.divergent)),
            kv("energy", Term::float(draw.stats.energy)),
        ]),
    ])
}

fn encode_summary(summary: &RunSummary) -> Term {
    Term::tuple([
        encode_status(&summary.status),
        Term::list(summary.param_names.iter().map(|name| Term::str(name.as_str()))),
        Term::list(summary.draws.iter().map(encode_draw)),
        Term::list([
            Term::tuple([
                Term::atom("warmup_iterations"),
                Term::int(summary.warmup_iterations as i64),
            ]),
            Term::tuple([
                Term::atom("sample_iterations"),
                Term::int(summary.sample_iterations as i64),
            ]),
            Term::tuple([
                Term::atom("divergences"),
                Term::int(summary.divergences as i64),
            ]),
        ]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeConfig;
    use crate::model::NormalMeanUnit;
    use pretty_assertions::assert_eq;

    fn bridge() -> Bridge {
        let bridge = Bridge::new(BridgeConfig { worker_threads: 2 }).unwrap();
        bridge.register_unit(Arc::new(NormalMeanUnit));
        bridge
    }

    #[test]
    fn add_is_a_working_smoke_test() {
        let bridge = bridge();
        assert_eq!(
            dispatch(&bridge, "add", &[Term::int(2), Term::int(3)]),
            Term::ok(Term::int(5))
        );
        assert_eq!(
            dispatch(&bridge, "add", &[Term::int(-1), Term::int(1)]),
            Term::ok(Term::int(0))
        );
    }

    #[test]
    fn wrong_arity_fails_before_decoding() {
        let bridge = bridge();
        let reply = dispatch(&bridge, "add", &[Term::int(2)]);
        assert!(reply.is_error_reply());
    }

    #[test]
    fn unknown_entry_points_are_undefined() {
        let bridge = bridge();
        let reply = dispatch(&bridge, "no_such_function", &[]);
        assert!(reply.is_error_reply());
    }

    #[test]
    fn bad_argument_types_yield_typed_errors() {
        let bridge = bridge();
        let reply = dispatch(&bridge, "add", &[Term::atom("two"), Term::int(3)]);
        let Term::Tuple(items) = &reply else {
            panic!("expected tuple reply");
        };
        let Term::Tuple(error) = &items[1] else {
            panic!("expected error detail");
        };
        assert_eq!(error[0], Term::atom("bad_argument"));
    }

    #[test]
    fn context_entry_decoding_supports_the_manifest_shape() {
        let term = Term::list([Term::tuple([
            Term::atom("theta"),
            Term::list([
                Term::float(1.0),
                Term::float(2.0),
                Term::float(3.0),
                Term::float(4.0),
            ]),
            Term::list([Term::int(2), Term::int(2)]),
        ])]);
        let entries = decode_context_entries(&term).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "theta");
        assert_eq!(entries[0].2, vec![2, 2]);
    }

    #[test]
    fn config_decoding_rejects_unknown_keys() {
        let term = Term::list([Term::tuple([Term::atom("not_a_key"), Term::int(1)])]);
        assert!(matches!(
            decode_config(&term),
            Err(ArgumentError::UnknownOption(_))
        ));
    }

    #[test]
    fn negative_counts_are_rejected() {
        let term = Term::list([Term::tuple([Term::atom("num_samples"), Term::int(-5)])]);
        assert!(matches!(
            decode_config(&term),
            Err(ArgumentError::Negative(-5))
        ));
    }
}
