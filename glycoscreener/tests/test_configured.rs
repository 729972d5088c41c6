use std::fs;
use std::path::Path;

use figment::{
    providers::{Format, Toml},
    Figment,
};

#[test_log::test]
#[test_log(default_log_filter = "debug")]
fn test_configured_screen() {
    let mut config = Figment::new();
    config = config.merge(Toml::file_exact("./tests/data/screen.toml"));
    let driver: glycoscreener::GlycoScreener = config.extract().unwrap();
    assert_eq!(driver.exclude_labels, ["K"]);
    assert_eq!(driver.fragmentation.max_depth, 3);
    assert_eq!(driver.fragmentation.modes, ["positive"]);
    driver.main().unwrap();

    let output_dir = Path::new("tmp/configured");
    let best = fs::read_to_string(output_dir.join("best.tsv")).unwrap();
    let rows: Vec<_> = best.lines().skip(1).collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].starts_with("LNT\tH\tscan_01\t1\t3\t"));
    assert!(rows[1].starts_with("LNnT\tH\tscan_01\t1\t3\t"));
    assert!(output_dir.join("rankings/LNnT/Na/scan_01.tsv").exists());
}
