use super::framework::run_dir;

#[test]
fn max_staleness() {
    run_dir("tests/json/data/max_staleness");
}
