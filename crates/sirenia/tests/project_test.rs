use sirenia::{ConstraintId, Error, Parameters, Solver, SolverAlgorithm, VariableId};

const TOL: f64 = 1e-4;

fn pos(s: &Solver, v: VariableId) -> f64 {
    s.variable(v).actual_pos()
}

fn assert_feasible(s: &Solver, gap_tolerance: f64) {
    for c in s.constraints() {
        if c.is_unsatisfiable() {
            continue;
        }
        let l = s.variable(c.left()).scaled_pos();
        let r = s.variable(c.right()).scaled_pos();
        if c.is_equality() {
            assert!(
                (r - l - c.gap()).abs() <= gap_tolerance,
                "equality {} -> {} gap {} violated: {}",
                c.left(),
                c.right(),
                c.gap(),
                r - l
            );
        } else {
            assert!(
                r - l >= c.gap() - gap_tolerance,
                "constraint {} -> {} gap {} violated: {}",
                c.left(),
                c.right(),
                c.gap(),
                r - l
            );
        }
    }
}

/// Deterministic LCG so the scenarios stay reproducible without a rand dependency.
struct Lcg(u64);

impl Lcg {
    fn next_unit(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }

    fn below(&mut self, n: usize) -> usize {
        ((self.next_unit() * n as f64) as usize).min(n - 1)
    }
}

fn chain() -> (Solver, [VariableId; 3], [ConstraintId; 2]) {
    let mut s = Solver::new();
    let a = s.add_variable(0.0).unwrap();
    let b = s.add_variable(0.0).unwrap();
    let c = s.add_variable(0.0).unwrap();
    let ab = s.add_constraint(a, b, 10.0).unwrap();
    let bc = s.add_constraint(b, c, 10.0).unwrap();
    (s, [a, b, c], [ab, bc])
}

#[test]
fn chain_settles_on_the_least_squares_positions() {
    let (mut s, [a, b, c], _) = chain();
    let solution = s.solve(&Parameters::default());

    assert_eq!(solution.algorithm_used, SolverAlgorithm::ProjectOnly);
    assert_eq!(solution.number_of_unsatisfiable_constraints, 0);
    assert!(!solution.execution_limit_exceeded());
    assert!((pos(&s, a) + 10.0).abs() < 1e-9);
    assert!(pos(&s, b).abs() < 1e-9);
    assert!((pos(&s, c) - 10.0).abs() < 1e-9);
    assert!(solution.max_constraint_tree_depth >= 2);
    // Σ x² - 2 d x with d = 0.
    assert!((solution.goal_function_value - 200.0).abs() < 1e-9);
}

#[test]
fn satisfied_constraints_leave_variables_in_place() {
    let mut s = Solver::new();
    let a = s.add_variable(0.0).unwrap();
    let b = s.add_variable(20.0).unwrap();
    let c = s.add_constraint(a, b, 10.0).unwrap();
    let solution = s.solve(&Parameters::default());

    assert_eq!(pos(&s, a), 0.0);
    assert_eq!(pos(&s, b), 20.0);
    assert!(!s.constraint(c).is_active());
    assert_eq!(s.block_count(), 2);
    assert_eq!(solution.outer_project_iterations, 1);
    assert_eq!(solution.inner_project_iterations_total, 0);
}

#[test]
fn weights_pull_the_block_toward_heavier_variables() {
    let mut s = Solver::new();
    let a = s.add_variable_with_weight(0.0, 3.0).unwrap();
    let b = s.add_variable_with_weight(0.0, 1.0).unwrap();
    s.add_constraint(a, b, 8.0).unwrap();
    s.solve(&Parameters::default());

    // minimize 3a² + b² with b = a + 8
    assert!((pos(&s, a) + 2.0).abs() < 1e-9);
    assert!((pos(&s, b) - 6.0).abs() < 1e-9);
}

#[test]
fn scaled_variables_are_constrained_on_scaled_positions() {
    let mut s = Solver::new();
    let a = s.add_variable_with_scale(0.0, 1.0, 2.0).unwrap();
    let b = s.add_variable_with_scale(0.0, 1.0, 1.0).unwrap();
    let c = s.add_constraint(a, b, 10.0).unwrap();
    s.solve(&Parameters::default());

    // minimize a² + b² with b - 2a = 10
    assert!((pos(&s, a) + 4.0).abs() < 1e-9);
    assert!((pos(&s, b) - 2.0).abs() < 1e-9);
    assert!(s.violation(c).abs() < 1e-9);
}

#[test]
fn three_cycle_marks_one_constraint_unsatisfiable() {
    let mut s = Solver::new();
    let a = s.add_variable(0.0).unwrap();
    let b = s.add_variable(0.0).unwrap();
    let c = s.add_variable(0.0).unwrap();
    s.add_constraint(a, b, 10.0).unwrap();
    s.add_constraint(b, c, 10.0).unwrap();
    let ca = s.add_constraint(c, a, 10.0).unwrap();
    let solution = s.solve(&Parameters::default());

    assert!(solution.number_of_unsatisfiable_constraints >= 1);
    assert!(s.constraint(ca).is_unsatisfiable());
    assert!(!solution.execution_limit_exceeded());
    assert_feasible(&s, TOL);
}

#[test]
fn conflicting_equalities_are_flagged_not_fatal() {
    let mut s = Solver::new();
    let a = s.add_variable(0.0).unwrap();
    let b = s.add_variable(0.0).unwrap();
    let c = s.add_variable(0.0).unwrap();
    s.add_equality_constraint(a, b, 3.0).unwrap();
    s.add_equality_constraint(b, c, 3.0).unwrap();
    let ac = s.add_equality_constraint(a, c, 9.0).unwrap();
    let solution = s.solve(&Parameters::default());

    assert_eq!(solution.number_of_unsatisfiable_constraints, 1);
    assert!(s.constraint(ac).is_unsatisfiable());
    assert!((pos(&s, b) - pos(&s, a) - 3.0).abs() < 1e-9);
    assert!((pos(&s, c) - pos(&s, b) - 3.0).abs() < 1e-9);
    assert!((pos(&s, a) + 3.0).abs() < 1e-9);
}

#[test]
fn equalities_hold_even_against_desired_positions() {
    let mut s = Solver::new();
    let a = s.add_variable(0.0).unwrap();
    let b = s.add_variable(100.0).unwrap();
    s.add_equality_constraint(a, b, 4.0).unwrap();
    let solution = s.solve(&Parameters::default());

    assert_eq!(solution.number_of_unsatisfiable_constraints, 0);
    assert!((pos(&s, a) - 48.0).abs() < 1e-9);
    assert!((pos(&s, b) - 52.0).abs() < 1e-9);
}

#[test]
fn random_acyclic_problems_end_feasible_and_optimal() {
    let mut rng = Lcg(0x5eed);
    for round in 0..5 {
        let mut s = Solver::new();
        let n = 40 + 20 * round;
        let vars: Vec<_> = (0..n)
            .map(|_| {
                let desired = rng.next_unit() * 100.0;
                let weight = 1.0 + rng.below(3) as f64;
                s.add_variable_with_weight(desired, weight).unwrap()
            })
            .collect();
        for _ in 0..(n * 5 / 2) {
            let i = rng.below(n);
            let j = rng.below(n);
            if i == j {
                continue;
            }
            let (l, r) = if i < j { (i, j) } else { (j, i) };
            let gap = rng.next_unit() * 10.0;
            s.add_constraint(vars[l], vars[r], gap).unwrap();
        }

        let params = Parameters::default();
        let solution = s.solve(&params);
        assert_eq!(solution.number_of_unsatisfiable_constraints, 0);
        assert!(!solution.execution_limit_exceeded());
        assert_feasible(&s, params.gap_tolerance);
        assert!(solution.min_inner_project_iterations <= solution.max_inner_project_iterations);

        // No active constraint is worth releasing any more.
        for c in s.constraints() {
            if c.is_active() && !c.is_equality() {
                assert!(
                    c.lagrangian() >= params.advanced.min_split_lagrangian_threshold,
                    "active constraint with negative multiplier {}",
                    c.lagrangian()
                );
            }
        }
    }
}

#[test]
fn violation_cache_does_not_change_the_result() {
    let build = || {
        let mut rng = Lcg(42);
        let mut s = Solver::new();
        let vars: Vec<_> = (0..300)
            .map(|_| s.add_variable(rng.next_unit() * 50.0).unwrap())
            .collect();
        for i in 0..299 {
            s.add_constraint(vars[i], vars[i + 1], 1.0 + rng.next_unit()).unwrap();
        }
        (s, vars)
    };

    let (mut cached, vars) = build();
    cached.solve(&Parameters::default());

    let (mut uncached, _) = build();
    let mut params = Parameters::default();
    params.advanced.use_violation_cache = false;
    uncached.solve(&params);

    for &v in &vars {
        let delta = cached.variable(v).actual_pos() - uncached.variable(v).actual_pos();
        assert!(delta.abs() < 1e-3);
    }
}

#[test]
fn resolve_without_changes_is_idempotent() {
    let mut rng = Lcg(7);
    let mut s = Solver::new();
    let vars: Vec<_> = (0..50)
        .map(|_| s.add_variable(rng.next_unit() * 30.0).unwrap())
        .collect();
    for _ in 0..120 {
        let i = rng.below(50);
        let j = rng.below(50);
        if i < j {
            s.add_constraint(vars[i], vars[j], 2.0).unwrap();
        }
    }
    let params = Parameters::default();
    s.solve(&params);
    let first: Vec<f64> = vars.iter().map(|&v| s.variable(v).actual_pos()).collect();

    let again = s.solve(&params);
    assert!(!again.execution_limit_exceeded());
    for (&v, before) in vars.iter().zip(first) {
        assert!((s.variable(v).actual_pos() - before).abs() <= params.gap_tolerance);
    }
}

#[test]
fn gap_update_resolves_from_the_previous_blocks() {
    let (mut s, [a, b, c], [_, bc]) = chain();
    s.solve(&Parameters::default());

    s.set_constraint_update(bc, 20.0).unwrap();
    let solution = s.solve(&Parameters::default());

    assert_eq!(s.constraint(bc).gap(), 20.0);
    assert_eq!(solution.number_of_unsatisfiable_constraints, 0);
    // A = x, B = x + 10, C = x + 30 with Σ = 0.
    assert!((pos(&s, a) + 40.0 / 3.0).abs() < 1e-6);
    assert!((pos(&s, b) + 10.0 / 3.0).abs() < 1e-6);
    assert!((pos(&s, c) - 50.0 / 3.0).abs() < 1e-6);
}

#[test]
fn shrinking_a_gap_releases_the_block() {
    let (mut s, [a, b, c], [ab, bc]) = chain();
    s.solve(&Parameters::default());

    s.set_constraint_update(ab, 0.0).unwrap();
    s.set_constraint_update(bc, 0.0).unwrap();
    s.solve(&Parameters::default());

    for v in [a, b, c] {
        assert!(pos(&s, v).abs() < 1e-9);
    }
}

#[test]
fn last_queued_gap_update_wins() {
    let mut s = Solver::new();
    let a = s.add_variable(0.0).unwrap();
    let b = s.add_variable(0.0).unwrap();
    let ab = s.add_constraint(a, b, 10.0).unwrap();
    s.solve(&Parameters::default());

    // Queued back to the applied gap: nothing changes.
    s.set_constraint_update(ab, 20.0).unwrap();
    s.set_constraint_update(ab, 10.0).unwrap();
    s.solve(&Parameters::default());
    assert_eq!(s.constraint(ab).gap(), 10.0);
    assert!((pos(&s, a) + 5.0).abs() < 1e-9);
    assert!((pos(&s, b) - 5.0).abs() < 1e-9);

    s.set_constraint_update(ab, 30.0).unwrap();
    s.set_constraint_update(ab, 25.0).unwrap();
    s.solve(&Parameters::default());
    assert_eq!(s.constraint(ab).gap(), 25.0);
    assert!((pos(&s, a) + 12.5).abs() < 1e-9);
    assert!((pos(&s, b) - 12.5).abs() < 1e-9);
}

#[test]
fn equality_gap_update_rebuilds_blocks() {
    let mut s = Solver::new();
    let a = s.add_variable(0.0).unwrap();
    let b = s.add_variable(0.0).unwrap();
    let eq = s.add_equality_constraint(a, b, 2.0).unwrap();
    s.solve(&Parameters::default());
    assert!((pos(&s, a) + 1.0).abs() < 1e-9);

    s.set_constraint_update(eq, 4.0).unwrap();
    let solution = s.solve(&Parameters::default());
    assert_eq!(solution.number_of_unsatisfiable_constraints, 0);
    assert!((pos(&s, a) + 2.0).abs() < 1e-9);
    assert!((pos(&s, b) - 2.0).abs() < 1e-9);
}

#[test]
fn edited_desired_positions_are_picked_up_by_solve() {
    let (mut s, [a, b, c], _) = chain();
    s.solve(&Parameters::default());

    for v in [a, b, c] {
        s.set_variable_desired_pos(v, 30.0).unwrap();
    }
    s.solve(&Parameters::default());

    assert!((pos(&s, a) - 20.0).abs() < 1e-9);
    assert!((pos(&s, b) - 30.0).abs() < 1e-9);
    assert!((pos(&s, c) - 40.0).abs() < 1e-9);
}

#[test]
fn no_constraints_returns_immediately() {
    let mut s = Solver::new();
    let a = s.add_variable(12.5).unwrap();
    let solution = s.solve(&Parameters::default());

    assert_eq!(pos(&s, a), 12.5);
    assert_eq!(solution.outer_project_iterations, 0);
    assert_eq!(solution.min_inner_project_iterations, 0);
    assert_eq!(solution.max_inner_project_iterations, 0);
}

#[test]
fn invalid_input_is_rejected() {
    let mut s = Solver::new();
    assert!(matches!(
        s.add_variable_with_weight(1.0, 0.0),
        Err(Error::InvalidVariable { .. })
    ));
    assert!(matches!(
        s.add_variable_with_scale(1.0, 1.0, f64::NAN),
        Err(Error::InvalidVariable { .. })
    ));
    let a = s.add_variable(0.0).unwrap();
    let b = s.add_variable(0.0).unwrap();
    assert!(matches!(
        s.add_constraint(a, a, 1.0),
        Err(Error::SelfConstraint { .. })
    ));
    assert!(matches!(
        s.add_constraint(a, b, -1.0),
        Err(Error::InvalidGap { .. })
    ));
    assert!(matches!(
        s.add_constraint(a, b, f64::INFINITY),
        Err(Error::InvalidGap { .. })
    ));
    let c = s.add_constraint(a, b, 1.0).unwrap();
    assert!(matches!(
        s.set_constraint_update(c, f64::NAN),
        Err(Error::InvalidGap { .. })
    ));
    assert!(matches!(
        s.set_variable_weight(a, -2.0),
        Err(Error::InvalidVariable { .. })
    ));
}
