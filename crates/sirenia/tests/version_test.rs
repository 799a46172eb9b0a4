#[test]
fn version_matches_cargo_package_version() {
    assert_eq!(sirenia::VERSION, env!("CARGO_PKG_VERSION"));
}
