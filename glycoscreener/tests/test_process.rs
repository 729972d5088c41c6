use std::{error::Error, fs, path::Path, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

fn screen_command(output_dir: &str) -> Result<Command, Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("glycoscreener")?;
    cmd.env("RUST_LOG", "info");
    cmd.arg("./tests/data/reactions.dwar")
        .arg("./tests/data/candidates.tsv")
        .arg("./tests/data/datum")
        .args(["-p", "./tests/data/fragments", "-o", output_dir, "-t", "2"]);
    Ok(cmd)
}

#[test]
fn test_file_missing() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("glycoscreener")?;

    cmd.arg("not_real.dwar")
        .arg("./tests/data/candidates.tsv")
        .arg("./tests/data/datum")
        .args(["-o", "tmp/missing"]);
    cmd.assert().failure().stderr(predicate::str::contains(
        "Failed to read the reaction rule table not_real.dwar",
    ));
    Ok(())
}

#[test]
fn test_missing_fragmentation_fails() -> Result<(), Box<dyn Error>> {
    let mut cmd = screen_command("tmp/no-potassium")?;
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("No precomputed fragmentation for"))
        .stderr(predicate::str::contains("with K"));
    Ok(())
}

#[test]
fn test_screen() -> Result<(), Box<dyn Error>> {
    let mut cmd = screen_command("tmp/screen")?;
    cmd.args(["-x", "K"]);
    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Ionization labels: H, Na"))
        .stderr(predicate::str::contains("Fragmentations: 6"))
        .stderr(predicate::str::contains("Combinations: 4 | Spectra Scored: 12"));

    let output_dir = Path::new("tmp/screen");
    let summary = fs::read_to_string(output_dir.join("summary.tsv"))?;
    let lines: Vec<_> = summary.lines().collect();
    assert_eq!(
        lines[0],
        "molecule\tadduct\tspectrum\trank\ttotal\tsolutionScore\tbestCandidate\tbestScore"
    );
    assert_eq!(lines.len(), 5);
    assert!(lines[1].starts_with("LNT\tH\tscan_01\t1\t3\t"));
    assert!(lines[1].contains("\tLNT\t"));
    assert!(lines[3].starts_with("LNnT\tH\tscan_01\t1\t3\t"));

    let ranking = fs::read_to_string(output_dir.join("rankings/LNT/H/scan_01.tsv"))?;
    let rows: Vec<_> = ranking.lines().skip(1).collect();
    assert_eq!(rows.len(), 3);
    assert!(rows[0].starts_with("1\tLNT\t"));
    assert!(rows[0].contains("\t4\t5\t5\t*\t"));
    assert!(rows[2].starts_with("3\tLactose\t"));
    assert!(!output_dir.join("precursors.tsv").exists());
    Ok(())
}

#[test]
fn test_screen_ms3() -> Result<(), Box<dyn Error>> {
    let mut cmd = screen_command("tmp/screen-ms3")?;
    cmd.args(["-x", "K", "--precursor-mz", "366.14", "--metric", "tanimoto"]);
    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Precursors Not Found: 4"))
        .stderr(predicate::str::contains("Invalid Edges: 0"))
        .stderr(predicate::str::contains("Solutions Not Applicable: "));

    let output_dir = Path::new("tmp/screen-ms3");
    let precursors = fs::read_to_string(output_dir.join("precursors.tsv"))?;
    assert!(precursors.contains("\t204.0900,366.1400\n"));
    assert!(precursors.contains("Lactose\tH\tNA\tNA\n"));
    assert!(precursors.contains("LNT\tNa\tNA\tNA\n"));

    let verification = fs::read_to_string(output_dir.join("verification.tsv"))?;
    let rows: Vec<_> = verification.lines().skip(1).collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].starts_with("LNT\tH\tscan_01\t4\t0\t0\t4\t"));

    let ranking = fs::read_to_string(output_dir.join("rankings/LNT/Na/scan_01.tsv"))?;
    assert_eq!(
        ranking.lines().skip(1).filter(|l| l.ends_with("\tNA")).count(),
        3
    );

    let summary = fs::read_to_string(output_dir.join("summary.tsv"))?;
    assert!(summary.contains("LNT\tNa\tscan_01\tNA\t3\tNA\tNA\tNA\n"));
    let best = fs::read_to_string(output_dir.join("best.tsv"))?;
    assert!(!best.contains("\tNA\t"));
    Ok(())
}
