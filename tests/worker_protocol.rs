//! End-to-end tests driving the compiled worker over pipes.
//!
//! Each test runs the binary in a scratch directory with its model and
//! output roots pointed at temp dirs, feeds job lines on stdin, closes it,
//! and inspects every line written to stdout.

use image::{Rgb, RgbImage};
use serde_json::{Value, json};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

fn worker(tmp: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_upscale-worker"));
    cmd.current_dir(tmp)
        .env("MODEL_CACHE_DIR", tmp.join("models"))
        .env("OUTPUT_DIR", tmp.join("results"))
        .env("RUST_LOG", "off");
    cmd
}

fn serve(tmp: &Path, input: &str) -> Output {
    let mut child = worker(tmp)
        .arg("serve")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    child.wait_with_output().unwrap()
}

fn lines(output: &Output) -> Vec<Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn write_model(tmp: &Path, name: &str) {
    let dir = tmp.join("models").join("upscale_models");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(name), b"weights").unwrap();
}

// =========================================================================
// serve
// =========================================================================

#[test]
fn startup_without_default_model_warns_then_ready() {
    let tmp = TempDir::new().unwrap();
    let output = serve(tmp.path(), "");
    assert!(output.status.success());

    let msgs = lines(&output);
    assert_eq!(msgs.len(), 3);
    assert_eq!(msgs[0], json!({"type": "status", "message": "loading_models"}));
    assert_eq!(msgs[1]["type"], "warning");
    assert!(
        msgs[1]["message"]
            .as_str()
            .unwrap()
            .starts_with("Could not pre-load ESRGAN model")
    );
    assert_eq!(msgs[2], json!({"type": "status", "message": "ready"}));
}

#[test]
fn every_line_gets_exactly_one_response() {
    let tmp = TempDir::new().unwrap();
    write_model(tmp.path(), "4x-UltraSharp.pth");
    let input = [
        "this is not json".to_string(),
        String::new(),
        json!({"method": "dalle", "config": {}, "job_id": "j-unknown"}).to_string(),
        json!({
            "method": "esrgan",
            "config": {"image_path": tmp.path().join("missing.png")},
            "job_id": "j-missing"
        })
        .to_string(),
    ]
    .join("\n");

    let output = serve(tmp.path(), &input);
    assert!(output.status.success());

    let msgs = lines(&output);
    // loading_models, ready, then three responses (blank line skipped)
    assert_eq!(msgs.len(), 5, "{:?}", msgs);
    assert_eq!(msgs[1]["message"], "ready");

    assert_eq!(msgs[2]["type"], "error");
    assert_eq!(msgs[2]["job_id"], "unknown");

    assert_eq!(msgs[3]["type"], "error");
    assert_eq!(msgs[3]["job_id"], "j-unknown");
    assert_eq!(msgs[3]["error"], "Unknown method: dalle");

    assert_eq!(msgs[4]["type"], "error");
    assert_eq!(msgs[4]["job_id"], "j-missing");
    assert!(
        msgs[4]["traceback"]
            .as_str()
            .unwrap()
            .starts_with("InputNotFound")
    );
}

#[test]
fn esrgan_job_writes_planned_output() {
    let tmp = TempDir::new().unwrap();
    write_model(tmp.path(), "4x-UltraSharp.pth");
    let input_path = tmp.path().join("scan.png");
    RgbImage::from_fn(16, 12, |x, y| Rgb([(x * 16) as u8, (y * 20) as u8, 90]))
        .save(&input_path)
        .unwrap();

    let job = json!({
        "method": "esrgan",
        "config": {"image_path": input_path, "tile_size": 8, "tile_overlap": 2},
        "job_id": "j1"
    });
    let output = serve(tmp.path(), &format!("{}\n", job));
    assert!(output.status.success());

    let msgs = lines(&output);
    let result = msgs.last().unwrap();
    assert_eq!(result["type"], "result");
    assert_eq!(result["job_id"], "j1");
    assert_eq!(result["status"], "completed");
    assert_eq!(result["output_width"], 64);
    assert_eq!(result["output_height"], 48);
    assert!(result["crop_info"].is_null());

    let written = Path::new(result["output_path"].as_str().unwrap());
    assert_eq!(written, tmp.path().join("results").join("scan_esrgan.png"));
    assert_eq!(image::image_dimensions(written).unwrap(), (64, 48));
}

#[test]
fn rejected_jobs_leave_the_worker_serving() {
    let tmp = TempDir::new().unwrap();
    write_model(tmp.path(), "4x-UltraSharp.pth");
    let input_path = tmp.path().join("scan.png");
    RgbImage::from_fn(12, 8, |x, y| Rgb([(x * 20) as u8, (y * 30) as u8, 60]))
        .save(&input_path)
        .unwrap();

    let input = [
        json!({
            "method": "esrgan",
            "config": {
                "image_path": input_path,
                "target_width_inches": 100000,
                "target_height_inches": 100000,
                "target_dpi": 300
            },
            "job_id": "j-huge"
        }),
        json!({
            "method": "esrgan",
            "config": {"image_path": input_path, "output_name": "../escaped"},
            "job_id": "j-path"
        }),
        json!({
            "method": "esrgan",
            "config": {"image_path": input_path, "tile_size": 8, "tile_overlap": 2},
            "job_id": 17
        }),
    ]
    .map(|l| l.to_string())
    .join("\n");

    let output = serve(tmp.path(), &input);
    assert!(output.status.success());

    let msgs = lines(&output);
    assert_eq!(msgs.len(), 5, "{:?}", msgs);
    assert_eq!(msgs[2]["type"], "error");
    assert_eq!(msgs[2]["job_id"], "j-huge");
    assert!(msgs[2]["traceback"].as_str().unwrap().starts_with("InvalidConfig"));
    assert_eq!(msgs[3]["type"], "error");
    assert_eq!(msgs[3]["job_id"], "j-path");
    assert!(!tmp.path().join("escaped.png").exists());

    assert_eq!(msgs[4]["type"], "result");
    assert_eq!(msgs[4]["job_id"], "17");
    assert_eq!(msgs[4]["output_width"], 48);
}

// =========================================================================
// plan / gen-config
// =========================================================================

#[test]
fn plan_prints_crop_json() {
    let tmp = TempDir::new().unwrap();
    let output = worker(tmp.path())
        .args([
            "plan",
            "--width",
            "1000",
            "--height",
            "1000",
            "--print-width",
            "4",
            "--print-height",
            "6",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let plan: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["crop_direction"], "horizontal");
    assert_eq!(plan["output_width_px"], 900);
    assert_eq!(plan["output_height_px"], 900);
    assert_eq!(plan["crop_amount_px"], 300);
}

#[test]
fn gen_config_is_loadable() {
    let tmp = TempDir::new().unwrap();
    let output = worker(tmp.path()).arg("gen-config").output().unwrap();
    assert!(output.status.success());

    let text = String::from_utf8(output.stdout).unwrap();
    std::fs::write(tmp.path().join("upscale-worker.toml"), &text).unwrap();

    // The generated file must be accepted back as the worker's own config.
    let output = worker(tmp.path())
        .args(["plan", "--width", "10", "--height", "10"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let dims: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(dims["output_width"], 40);
}
