//! Leapfrog integration and the no-u-turn transition.
//!
//! One transition resamples the momentum, then grows a trajectory by
//! repeated doubling until the no-u-turn criterion fires, the tree depth
//! limit is reached, or a divergence appears. Proposals are selected by
//! multinomial weighting among slice-admissible states.
//!
//! Recoverable density errors inside a leapfrog step are folded into the
//! divergence machinery: the offending subtree is discarded and the chain
//! keeps its current state, which is exactly an automatic rejection.

use rand::Rng;

use crate::mass_matrix::DiagMassMatrix;
use crate::model::{Density, DensityError};

/// A point in phase space with its cached density evaluation.
#[derive(Debug, Clone)]
pub(crate) struct PhasePoint {
    pub position: Vec<f64>,
    pub momentum: Vec<f64>,
    pub gradient: Vec<f64>,
    pub logp: f64,
}

impl PhasePoint {
    pub fn energy(&self, mass: &DiagMassMatrix) -> f64 {
        -self.logp + mass.kinetic_energy(&self.momentum)
    }
}

/// Evaluate the density at a position, producing a resting phase point.
pub(crate) fn init_point(
    density: &dyn Density,
    position: &[f64],
) -> Result<PhasePoint, DensityError> {
    let dim = density.dim();
    let mut gradient = vec![0.0; dim];
    let logp = density.logp_gradient(position, &mut gradient)?;
    if !logp.is_finite() {
        return Err(DensityError::NonFinite);
    }
    Ok(PhasePoint {
        position: position.to_vec(),
        momentum: vec![0.0; dim],
        gradient,
        logp,
    })
}

/// One leapfrog step of signed size `eps`.
///
/// `Ok(None)` means the density failed recoverably at the new position;
/// the caller turns that into a rejected subtree.
fn leapfrog(
    density: &dyn Density,
    mass: &DiagMassMatrix,
    start: &PhasePoint,
    eps: f64,
) -> Result<Option<PhasePoint>, DensityError> {
    let dim = start.position.len();

    let mut momentum: Vec<f64> = start
        .momentum
        .iter()
        .zip(start.gradient.iter())
        .map(|(&p, &g)| p + 0.5 * eps * g)
        .collect();

    let mut velocity = vec![0.0; dim];
    mass.velocity(&momentum, &mut velocity);

    let position: Vec<f64> = start
        .position
        .iter()
        .zip(velocity.iter())
        .map(|(&q, &v)| q + eps * v)
        .collect();

    let mut gradient = vec![0.0; dim];
    let logp = match density.logp_gradient(&position, &mut gradient) {
        Ok(logp) if logp.is_finite() => logp,
        Ok(_) => return Ok(None),
        Err(err) if err.is_recoverable() => return Ok(None),
        Err(err) => return Err(err),
    };

    for (p, &g) in momentum.iter_mut().zip(gradient.iter()) {
        *p += 0.5 * eps * g;
    }

    Ok(Some(PhasePoint {
        position,
        momentum,
        gradient,
        logp,
    }))
}

struct Tree {
    left: PhasePoint,
    right: PhasePoint,
    proposal: PhasePoint,
    log_weight: f64,
    sum_accept: f64,
    n_leapfrog: u64,
    divergent: bool,
    numeric_rejection: bool,
    turning: bool,
}

/// Result of one transition.
#[derive(Debug)]
pub(crate) struct Transition {
    pub point: PhasePoint,
    pub depth: u64,
    pub n_leapfrog: u64,
    pub divergent: bool,
    /// The divergence came from a recoverable density failure rather than
    /// an energy blowup.
    pub numeric_rejection: bool,
    pub accept_prob: f64,
    pub energy: f64,
}

fn logaddexp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Generalized no-u-turn criterion across the trajectory endpoints.
fn is_turning(left: &PhasePoint, right: &PhasePoint, mass: &DiagMassMatrix) -> bool {
    let projected = |point: &PhasePoint| {
        right
            .position
            .iter()
            .zip(left.position.iter())
            .zip(point.momentum.iter())
            .zip(mass.variance().iter())
            .map(|(((&r, &l), &p), &var)| (r - l) * p * var)
            .sum::<f64>()
    };
    projected(left) < 0.0 || projected(right) < 0.0
}

/// A subtree standing in for a leapfrog step that failed recoverably:
/// weightless, divergent, never expanded further.
fn rejected_leaf(start: &PhasePoint) -> Tree {
    Tree {
        left: start.clone(),
        right: start.clone(),
        proposal: start.clone(),
        log_weight: f64::NEG_INFINITY,
        sum_accept: 0.0,
        n_leapfrog: 1,
        divergent: true,
        numeric_rejection: true,
        turning: false,
    }
}

#[allow(clippy::too_many_arguments)]
fn build_leaf(
    density: &dyn Density,
    mass: &DiagMassMatrix,
    start: &PhasePoint,
    eps: f64,
    log_u: f64,
    h0: f64,
    max_energy_error: f64,
) -> Result<Tree, DensityError> {
    let Some(point) = leapfrog(density, mass, start, eps)? else {
        return Ok(rejected_leaf(start));
    };

    let h = point.energy(mass);
    let energy_error = h - h0;
    let divergent = energy_error.abs() > max_energy_error;
    let log_weight = if log_u <= -h {
        0.0
    } else {
        f64::NEG_INFINITY
    };
    let accept = (-energy_error).exp().min(1.0);

    Ok(Tree {
        left: point.clone(),
        right: point.clone(),
        proposal: point,
        log_weight,
        sum_accept: accept,
        n_leapfrog: 1,
        divergent,
        numeric_rejection: false,
        turning: false,
    })
}

#[allow(clippy::too_many_arguments)]
fn build_tree<R: Rng + ?Sized>(
    density: &dyn Density,
    mass: &DiagMassMatrix,
    start: &PhasePoint,
    depth: u64,
    eps: f64,
    log_u: f64,
    h0: f64,
    max_energy_error: f64,
    rng: &mut R,
) -> Result<Tree, DensityError> {
    if depth == 0 {
        return build_leaf(density, mass, start, eps, log_u, h0, max_energy_error);
    }

    let mut tree = build_tree(
        density,
        mass,
        start,
        depth - 1,
        eps,
        log_u,
        h0,
        max_energy_error,
        rng,
    )?;
    if tree.divergent || tree.turning {
        return Ok(tree);
    }

    let edge = if eps > 0.0 {
        tree.right.clone()
    } else {
        tree.left.clone()
    };
    let other = build_tree(
        density,
        mass,
        &edge,
        depth - 1,
        eps,
        log_u,
        h0,
        max_energy_error,
        rng,
    )?;

    let total = logaddexp(tree.log_weight, other.log_weight);
    if rng.random::<f64>() < (other.log_weight - total).exp() {
        tree.proposal = other.proposal;
    }
    tree.log_weight = total;
    tree.sum_accept += other.sum_accept;
    tree.n_leapfrog += other.n_leapfrog;
    tree.divergent |= other.divergent;
    tree.numeric_rejection |= other.numeric_rejection;

    if eps > 0.0 {
        tree.right = other.right;
    } else {
        tree.left = other.left;
    }
    tree.turning =
        tree.turning || other.turning || is_turning(&tree.left, &tree.right, mass);

    Ok(tree)
}

/// Run one no-u-turn transition from `start`.
///
/// Returns `Err` only for unrecoverable density failures; everything else
/// is reported through the transition record.
pub(crate) fn transition<R: Rng + ?Sized>(
    density: &dyn Density,
    mass: &DiagMassMatrix,
    mut start: PhasePoint,
    step_size: f64,
    max_depth: u64,
    max_energy_error: f64,
    rng: &mut R,
) -> Result<Transition, DensityError> {
    mass.randomize_momentum(rng, &mut start.momentum);
    let h0 = start.energy(mass);
    let log_u = rng.random::<f64>().ln() - h0;

    let mut tree = Tree {
        left: start.clone(),
        right: start.clone(),
        proposal: start,
        log_weight: 0.0,
        sum_accept: 0.0,
        n_leapfrog: 0,
        divergent: false,
        numeric_rejection: false,
        turning: false,
    };

    let mut depth_reached = 0;
    for depth in 0..max_depth {
        let forward = rng.random::<bool>();
        let eps = if forward { step_size } else { -step_size };
        let edge = if forward {
            tree.right.clone()
        } else {
            tree.left.clone()
        };

        let subtree = build_tree(
            density,
            mass,
            &edge,
            depth,
            eps,
            log_u,
            h0,
            max_energy_error,
            rng,
        )?;
        depth_reached = depth + 1;

        tree.n_leapfrog += subtree.n_leapfrog;
        tree.sum_accept += subtree.sum_accept;
        tree.divergent |= subtree.divergent;
        tree.numeric_rejection |= subtree.numeric_rejection;

        // A broken subtree is discarded wholesale; the trajectory so far
        // remains a valid sample source.
        if subtree.divergent || subtree.turning {
            break;
        }

        let total = logaddexp(tree.log_weight, subtree.log_weight);
        if rng.random::<f64>() < (subtree.log_weight - total).exp() {
            tree.proposal = subtree.proposal;
        }
        tree.log_weight = total;

        if forward {
            tree.right = subtree.right;
        } else {
            tree.left = subtree.left;
        }

        if is_turning(&tree.left, &tree.right, mass) {
            break;
        }
    }

    let accept_prob = tree.sum_accept / tree.n_leapfrog.max(1) as f64;
    Ok(Transition {
        point: tree.proposal,
        depth: depth_reached,
        n_leapfrog: tree.n_leapfrog,
        divergent: tree.divergent,
        numeric_rejection: tree.numeric_rejection,
        accept_prob,
        energy: h0,
    })
}
