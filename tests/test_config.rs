//! Tests for loading annopipe.yaml configuration.

use annopipe::cli::config::AnnopipeConfig;

#[test]
fn load_explicit_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("annopipe.yaml");
    std::fs::write(
        &path,
        r#"
data_dir: /var/lib/annopipe
documents_adapter: DATABASE
database_url: sqlite://annopipe.db?mode=rwc
max_concurrent_jobs: 8
s3:
  bucket: annopipe-exports
  endpoint_url: http://localhost:9000
  force_path_style: true
"#,
    )
    .unwrap();

    let config = AnnopipeConfig::load(Some(&path)).unwrap();
    assert_eq!(config.data_dir.as_deref(), Some("/var/lib/annopipe"));
    assert_eq!(config.documents_adapter.as_deref(), Some("DATABASE"));
    assert_eq!(config.objects_adapter, None);
    assert_eq!(config.max_concurrent_jobs, Some(8));

    let s3 = config.s3.unwrap();
    assert_eq!(s3.bucket, "annopipe-exports");
    assert_eq!(s3.endpoint_url.as_deref(), Some("http://localhost:9000"));
    assert!(s3.force_path_style);
    assert_eq!(s3.region, None);
}

#[test]
fn missing_fields_fall_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("annopipe.yaml");
    std::fs::write(&path, "data_dir: data\n").unwrap();

    let config = AnnopipeConfig::load(Some(&path)).unwrap();
    assert_eq!(config.data_dir.as_deref(), Some("data"));
    assert_eq!(config.documents_adapter, None);
    assert_eq!(config.database_url, None);
    assert!(config.s3.is_none());
}

#[test]
fn explicit_missing_path_is_an_error() {
    let result = AnnopipeConfig::load(Some(std::path::Path::new("/nonexistent/annopipe.yaml")));
    assert!(result.is_err());
}

#[test]
fn invalid_yaml_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("annopipe.yaml");
    std::fs::write(&path, "data_dir: [unclosed\n").unwrap();

    let result = AnnopipeConfig::load(Some(&path));
    assert!(result.is_err());
}
