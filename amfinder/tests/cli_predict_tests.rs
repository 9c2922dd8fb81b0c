mod common;

use common::*;
use tempfile::TempDir;

#[test]
fn test_predict_writes_archive_with_activation_maps() {
    let temp_dir = TempDir::new().unwrap();
    let model = write_model(temp_dir.path(), "model.json", CNN_MODEL);
    let image = write_mosaic(temp_dir.path(), "root.png", 50, 34);

    let output = run_amfinder(&[
        "predict",
        image.to_str().unwrap(),
        "--model",
        model.to_str().unwrap(),
        "--tile-size",
        "16",
        "--batch-size",
        "2",
        "--cams",
    ]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "predict failed: {stderr}");

    let archive = temp_dir.path().join("root.zip");
    assert_eq!(
        archive_entries(&archive),
        vec!["root.tsv", "root_CAM_N.jpg", "root_CAM_Y.jpg", "settings.toml"]
    );

    // 50x34 with 16 px tiles: 2 rows of 3 tiles
    let tsv = String::from_utf8(read_archive_entry(&archive, "root.tsv")).unwrap();
    let lines: Vec<&str> = tsv.lines().collect();
    assert_eq!(lines[0], "row\tcol\tY\tN");
    assert_eq!(lines.len(), 7);
    assert!(lines[4].starts_with("1\t0\t"));
    assert!(lines[6].starts_with("1\t2\t"));
    for line in &lines[1..] {
        let probs: Vec<f32> = line.split('\t').skip(2).map(|v| v.parse().unwrap()).collect();
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    }

    let cam = image::load_from_memory(&read_archive_entry(&archive, "root_CAM_Y.jpg")).unwrap();
    assert_eq!((cam.width(), cam.height()), (48, 32));

    let settings = String::from_utf8(read_archive_entry(&archive, "settings.toml")).unwrap();
    assert!(settings.contains("test-cnn"));
    assert!(settings.contains("tile_edge = 16"));
}

#[test]
fn test_predict_without_cams_writes_table_only() {
    let temp_dir = TempDir::new().unwrap();
    let model = write_model(temp_dir.path(), "model.json", CNN_MODEL);
    let image = write_mosaic(temp_dir.path(), "root.png", 32, 32);
    let out = temp_dir.path().join("results");

    let output = run_amfinder(&[
        "predict",
        image.to_str().unwrap(),
        "--model",
        model.to_str().unwrap(),
        "--tile-size",
        "16",
        "--header",
        "colonized,background",
        "--output-dir",
        out.to_str().unwrap(),
    ]);
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let archive = out.join("root.zip");
    assert_eq!(archive_entries(&archive), vec!["root.tsv", "settings.toml"]);
    let tsv = String::from_utf8(read_archive_entry(&archive, "root.tsv")).unwrap();
    assert!(tsv.starts_with("row\tcol\tcolonized\tbackground\n"));
}

#[test]
fn test_model_without_conv_fails_with_invalid_model_code() {
    let temp_dir = TempDir::new().unwrap();
    let model = write_model(temp_dir.path(), "dense.json", DENSE_ONLY_MODEL);
    let image = write_mosaic(temp_dir.path(), "root.png", 32, 32);

    let output = run_amfinder(&[
        "predict",
        image.to_str().unwrap(),
        "--model",
        model.to_str().unwrap(),
        "--tile-size",
        "16",
        "--cams",
        "--permissive",
    ]);
    assert_eq!(output.status.code(), Some(4));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no Conv2D layer"), "got: {stderr}");
    assert!(!temp_dir.path().join("root.zip").exists());
}

#[test]
fn test_model_without_conv_is_fine_without_cams() {
    let temp_dir = TempDir::new().unwrap();
    let model = write_model(temp_dir.path(), "dense.json", DENSE_ONLY_MODEL);
    let image = write_mosaic(temp_dir.path(), "root.png", 32, 32);

    let output = run_amfinder(&[
        "predict",
        image.to_str().unwrap(),
        "--model",
        model.to_str().unwrap(),
        "--tile-size",
        "16",
    ]);
    assert!(output.status.success());
    assert!(temp_dir.path().join("root.zip").exists());
}

#[test]
fn test_header_length_mismatch_is_model_error() {
    let temp_dir = TempDir::new().unwrap();
    let model = write_model(temp_dir.path(), "model.json", CNN_MODEL);
    let image = write_mosaic(temp_dir.path(), "root.png", 32, 32);

    let output = run_amfinder(&[
        "predict",
        image.to_str().unwrap(),
        "--model",
        model.to_str().unwrap(),
        "--header",
        "A,B,C",
    ]);
    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("header lists 3 labels"), "got: {stderr}");
}

#[test]
fn test_malformed_model_file() {
    let temp_dir = TempDir::new().unwrap();
    let model = write_model(temp_dir.path(), "broken.json", "{\"layers\": [{\"type\": \"lstm\"}]}");
    let image = write_mosaic(temp_dir.path(), "root.png", 32, 32);

    let output = run_amfinder(&[
        "predict",
        image.to_str().unwrap(),
        "--model",
        model.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn test_small_image_is_skipped_with_warning() {
    let temp_dir = TempDir::new().unwrap();
    let model = write_model(temp_dir.path(), "model.json", CNN_MODEL);
    let image = write_mosaic(temp_dir.path(), "thin.png", 100, 500);

    let output = run_amfinder(&[
        "predict",
        image.to_str().unwrap(),
        "--model",
        model.to_str().unwrap(),
    ]);
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    let warnings: Vec<&str> = stderr.lines().filter(|l| l.contains("[WARN]")).collect();
    assert_eq!(warnings.len(), 1, "expected a single warning, got: {stderr}");
    assert!(warnings[0].contains("smaller than one 126-pixel tile"));
    assert!(!temp_dir.path().join("thin.zip").exists());
}

#[test]
fn test_missing_image_strict_and_permissive() {
    let temp_dir = TempDir::new().unwrap();
    let model = write_model(temp_dir.path(), "model.json", CNN_MODEL);
    let image = write_mosaic(temp_dir.path(), "root.png", 32, 32);
    let missing = temp_dir.path().join("missing.png");

    let args = |permissive: bool| {
        let mut args = vec![
            "predict".to_string(),
            missing.to_string_lossy().to_string(),
            image.to_string_lossy().to_string(),
            "--model".to_string(),
            model.to_string_lossy().to_string(),
            "--tile-size".to_string(),
            "16".to_string(),
        ];
        if permissive {
            args.push("--permissive".to_string());
        }
        args
    };

    let strict: Vec<String> = args(false);
    let output = run_amfinder(&strict.iter().map(String::as_str).collect::<Vec<_>>());
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));

    let permissive: Vec<String> = args(true);
    let output = run_amfinder(&permissive.iter().map(String::as_str).collect::<Vec<_>>());
    assert!(output.status.success());
    assert!(temp_dir.path().join("root.zip").exists());
}

#[test]
fn test_invalid_cli_values_rejected() {
    let output = run_amfinder(&["predict", "x.png", "--model", "m.json", "--batch-size", "0"]);
    assert!(!output.status.success());
    let output = run_amfinder(&["predict", "x.png", "--model", "m.json", "--colormap", "bone"]);
    assert!(!output.status.success());
}

#[test]
fn test_version_command() {
    let output = run_amfinder(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("amfinder v{}", env!("CARGO_PKG_VERSION"))
    );
}
