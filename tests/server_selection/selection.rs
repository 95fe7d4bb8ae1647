use super::framework::run_dir;

#[test]
fn server_selection_read_and_write() {
    run_dir("tests/json/data/server_selection");
}
