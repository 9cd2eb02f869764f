use std::fs;

use recon_pipeline::merge::{merge, merge_into, usable_outputs};
use recon_pipeline::PipelineError;

#[test]
fn subfinder_and_amass_outputs_merge_into_sorted_unique_hosts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let subfinder = dir.path().join("subfinder.txt");
    let amass = dir.path().join("amass.txt");
    fs::write(&subfinder, "a.example.com\nb.example.com.\n").unwrap();
    fs::write(&amass, "b.example.com\nc.example.com\n").unwrap();

    let dest = dir.path().join("all_subdomains.txt");
    let hosts = merge_into(&[&subfinder, &amass], &dest).expect("merge ok");
    assert_eq!(hosts, vec!["a.example.com", "b.example.com", "c.example.com"]);
    assert_eq!(
        fs::read_to_string(&dest).unwrap(),
        "a.example.com\nb.example.com\nc.example.com\n"
    );

    // input order does not matter
    let again = merge(&[&amass, &subfinder]).unwrap();
    assert_eq!(again, hosts);
}

#[test]
fn merge_keeps_case_distinct_names() {
    let dir = tempfile::tempdir().unwrap();
    let f = dir.path().join("tool.txt");
    fs::write(&f, "WWW.example.com\nwww.example.com\n\n   \n").unwrap();
    let hosts = merge(&[&f]).unwrap();
    assert_eq!(hosts, vec!["WWW.example.com", "www.example.com"]);
}

#[test]
fn missing_and_empty_inputs_are_an_empty_universe() {
    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty.txt");
    fs::write(&empty, "\n\n").unwrap();
    let missing = dir.path().join("missing.txt");

    let err = merge(&[&empty, &missing]).unwrap_err();
    assert!(matches!(err, PipelineError::EmptyUniverse));
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn only_successful_tools_with_files_are_usable() {
    let dir = tempfile::tempdir().unwrap();
    let ok = dir.path().join("ok.txt");
    let failed = dir.path().join("failed.txt");
    fs::write(&ok, "a.example.com\n").unwrap();
    fs::write(&failed, "b.example.com\n").unwrap();
    let absent = dir.path().join("absent.txt");

    let usable = usable_outputs([(true, ok.clone()), (false, failed), (true, absent)]);
    assert_eq!(usable, vec![ok]);
}
