use super::framework::run_dir;

#[test]
fn sdam_single() {
    run_dir("tests/json/data/sdam/single");
}
