// tests/config_model.rs

//! Config building, TOML loading and submission ordering.

use std::fs;

use pipedag::config::{loader, topo_order};
use pipedag_test_utils::builders::{ConfigFileBuilder, TaskConfigBuilder};
use tempfile::TempDir;

#[test]
fn topo_order_puts_dependencies_first() {
    let cfg = ConfigFileBuilder::new()
        .with_task("merge", TaskConfigBuilder::new("merge").after("convert").after("mip").build())
        .with_task("convert", TaskConfigBuilder::new("tiff2zarr").build())
        .with_task("mip", TaskConfigBuilder::new("mip").after("convert").build())
        .build();

    let order = topo_order(&cfg);
    let pos = |name: &str| order.iter().position(|n| n == name).unwrap();

    assert!(pos("convert") < pos("mip"));
    assert!(pos("mip") < pos("merge"));
    assert!(pos("convert") < pos("merge"));
}

#[test]
fn toml_round_trip_through_loader() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("Pipedag.toml");
    fs::write(
        &path,
        r#"
[engine]
poll_interval_ms = 250
poll_timeout_ms = 60000
canceled_dependency_policy = "success"
owner = "lightsheet"

[cluster]
node_slots = 32
workers = 3
billing_account = "imaging"

[default]
slots = 4
memory_gb = 8

[task.deconvolve]
program = "decon"
args = ["--psf", "psf.tif"]
outputs = ["*.tif"]
instances = ["tile=0", "tile=1"]
slots = 16
on_cluster = true

[task.montage]
program = "montage"
after = ["deconvolve"]
outputs = ["montage.png"]
"#,
    )
    .unwrap();

    let cfg = loader::load_and_validate(&path).unwrap();

    assert_eq!(cfg.engine.poll_interval_ms, 250);
    assert_eq!(cfg.engine.owner, "lightsheet");
    assert_eq!(cfg.cluster.node_slots, 32);
    assert_eq!(cfg.cluster.workers, 3);

    let decon = &cfg.task["deconvolve"];
    assert_eq!(decon.effective_slots(&cfg.default), 16);
    assert_eq!(decon.effective_memory_gb(&cfg.default), 8);
    assert_eq!(decon.instances.len(), 2);
    assert!(decon.on_cluster);

    let montage = &cfg.task["montage"];
    assert_eq!(montage.effective_slots(&cfg.default), 4);
    assert_eq!(montage.after, vec!["deconvolve".to_string()]);

    // Geometry derives from the cluster section.
    let geometry = cfg.cluster.geometry();
    assert_eq!(geometry.node_slots, 32);
    assert_eq!(geometry.account.as_deref(), Some("imaging"));
}

#[test]
fn loader_rejects_bad_dependency() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("Pipedag.toml");
    fs::write(
        &path,
        r#"
[task.a]
program = "echo"
after = ["missing"]
outputs = ["*.out"]
"#,
    )
    .unwrap();

    assert!(loader::load_and_validate(&path).is_err());
}
