use sirenia::{Error, FIXED_VAR_WEIGHT, Parameters, SolverShell};

#[test]
fn separation_between_free_variables() {
    let mut shell = SolverShell::new();
    shell.add_variable_with_ideal_position("a", 0.0, 1.0).unwrap();
    shell.add_variable_with_ideal_position("b", 0.0, 1.0).unwrap();
    shell
        .add_left_right_separation_constraint("a", "b", 10.0, false)
        .unwrap();

    assert!(shell.solve(&Parameters::default()).unwrap());
    assert!((shell.variable_resolved_position("a").unwrap() + 5.0).abs() < 1e-9);
    assert!((shell.variable_resolved_position("b").unwrap() - 5.0).abs() < 1e-9);
    assert_eq!(shell.variable_ideal_position("a").unwrap(), 0.0);
    assert!(shell.solution().is_some());
}

#[test]
fn free_variable_moves_around_a_fixed_one() {
    let mut shell = SolverShell::new();
    shell.add_fixed_variable("wall", 0.0).unwrap();
    shell.add_variable_with_ideal_position("node", 3.0, 1.0).unwrap();
    shell
        .add_left_right_separation_constraint("wall", "node", 10.0, false)
        .unwrap();

    assert!(shell.solve(&Parameters::default()).unwrap());
    let wall = shell.variable_resolved_position("wall").unwrap();
    let node = shell.variable_resolved_position("node").unwrap();
    assert!(wall.abs() < 1e-4);
    assert!((node - 10.0).abs() < 1e-4);
    assert_eq!(
        shell.solver().variables()[0].weight(),
        FIXED_VAR_WEIGHT,
        "fixed variables carry the pinning weight"
    );
}

#[test]
fn fixed_variables_pushed_apart_get_their_gaps_relaxed() {
    let mut shell = SolverShell::new();
    shell.add_fixed_variable("a", 0.0).unwrap();
    shell.add_fixed_variable("b", 5.0).unwrap();
    shell
        .add_left_right_separation_constraint("a", "b", 10.0, false)
        .unwrap();

    assert!(shell.solve(&Parameters::default()).unwrap());
    assert!(shell.variable_resolved_position("a").unwrap().abs() < 1e-9);
    assert!((shell.variable_resolved_position("b").unwrap() - 5.0).abs() < 1e-9);
    assert_eq!(shell.solver().constraints()[0].gap(), 5.0);
}

#[test]
fn bounds_clamp_resolved_positions() {
    let mut shell = SolverShell::new();
    shell.add_variable_with_ideal_position("x", 10.0, 1.0).unwrap();
    shell.add_variable_with_ideal_position("y", -3.0, 1.0).unwrap();
    shell.set_upper_bound("x", 4.0).unwrap();
    shell.set_low_bound("y", 0.0).unwrap();

    assert!(shell.solve(&Parameters::default()).unwrap());
    assert_eq!(shell.variable_resolved_position("x").unwrap(), 4.0);
    assert_eq!(shell.variable_resolved_position("y").unwrap(), 0.0);
    // One anchor variable and one constraint per bound.
    assert_eq!(shell.solver().variable_count(), 4);
    assert_eq!(shell.solver().constraint_count(), 2);

    assert!(matches!(
        shell.set_low_bound("x", 1.0),
        Err(Error::SolverSealed)
    ));
}

#[test]
fn duplicate_constraints_are_ignored() {
    let mut shell = SolverShell::new();
    shell.add_variable_with_ideal_position("a", 0.0, 1.0).unwrap();
    shell.add_variable_with_ideal_position("b", 0.0, 1.0).unwrap();
    for _ in 0..3 {
        shell
            .add_left_right_separation_constraint("a", "b", 2.0, false)
            .unwrap();
    }
    shell
        .add_left_right_separation_constraint("a", "b", 2.0, true)
        .unwrap();
    shell
        .add_left_right_separation_constraint("a", "b", 3.0, false)
        .unwrap();

    assert_eq!(shell.solver().constraint_count(), 3);
}

#[test]
fn unknown_and_duplicate_ids_are_errors() {
    let mut shell = SolverShell::new();
    shell.add_variable_with_ideal_position("a", 0.0, 1.0).unwrap();

    assert!(matches!(
        shell.add_variable_with_ideal_position("a", 1.0, 1.0),
        Err(Error::DuplicateVariable { .. })
    ));
    assert!(matches!(
        shell.add_left_right_separation_constraint("a", "missing", 1.0, false),
        Err(Error::UnknownVariable { .. })
    ));
    assert!(matches!(
        shell.variable_resolved_position("missing"),
        Err(Error::UnknownVariable { .. })
    ));
    assert!(matches!(
        shell.set_upper_bound("missing", 1.0),
        Err(Error::UnknownVariable { .. })
    ));
    assert!(shell.contains_variable("a"));
    assert!(!shell.contains_variable("missing"));
}

#[cfg(feature = "qpsc")]
#[test]
fn closeness_goal_routes_through_qpsc() {
    let mut shell = SolverShell::new();
    shell.add_variable_with_ideal_position("a", 0.0, 1.0).unwrap();
    shell.add_variable_with_ideal_position("b", 100.0, 1.0).unwrap();
    shell.add_goal_two_variables_are_close("a", "b", 1.0).unwrap();

    let params = Parameters {
        qpsc_convergence_epsilon: 1e-9,
        qpsc_convergence_quotient: 1e-10,
        ..Default::default()
    };
    assert!(shell.solve(&params).unwrap());
    assert!((shell.variable_resolved_position("a").unwrap() - 100.0 / 3.0).abs() < 1e-2);
    assert!((shell.variable_resolved_position("b").unwrap() - 200.0 / 3.0).abs() < 1e-2);
}
