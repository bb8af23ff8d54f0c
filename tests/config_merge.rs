//! `read_config`'s repo-local layer and `apply_overrides`'s typed `--set` parsing, exercised
//! end-to-end against real files rather than in-process `Value`s.

use quack_gateway::gateway::config;

#[test]
fn read_config_loads_the_repo_local_layer() {
    let tmp = tempfile::tempdir().unwrap();
    let configs_dir = tmp.path().join("configs");
    std::fs::create_dir_all(&configs_dir).unwrap();
    std::fs::write(
        configs_dir.join("config.json"),
        r#"{"default_model": "gpt-4o", "host": "0.0.0.0", "port": 9000}"#,
    )
    .unwrap();

    let loaded = config::read_config("config.json", tmp.path()).expect("repo-local layer should load");
    assert_eq!(loaded.default_model, "gpt-4o");
    assert_eq!(loaded.host, "0.0.0.0");
    assert_eq!(loaded.port, 9000);
}

#[test]
fn read_config_with_no_layers_present_falls_back_to_defaults() {
    let tmp = tempfile::tempdir().unwrap();
    let loaded = config::read_config("does-not-exist.json", tmp.path()).expect("missing layers are not an error");
    assert_eq!(loaded.host, "127.0.0.1");
    assert_eq!(loaded.port, 8000);
    assert_eq!(loaded.max_steps, 15);
}

#[test]
fn llms_table_preserves_its_on_disk_key_order() {
    let tmp = tempfile::tempdir().unwrap();
    let configs_dir = tmp.path().join("configs");
    std::fs::create_dir_all(&configs_dir).unwrap();
    std::fs::write(
        configs_dir.join("config.json"),
        r#"{
            "llms": {
                "zeta": {"api_endpoint": "https://z", "provider": "openai", "model": "gpt-4o"},
                "alpha": {"api_endpoint": "https://a", "provider": "openai", "model": "gpt-4o"},
                "mid": {"api_endpoint": "https://m", "provider": "openai", "model": "gpt-4o"}
            }
        }"#,
    )
    .unwrap();

    let loaded = config::read_config("config.json", tmp.path()).unwrap();
    let keys: Vec<&String> = loaded.llms.keys().collect();
    assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
}

#[test]
fn apply_overrides_rejects_non_numeric_value_for_a_numeric_field() {
    let mut cfg = config::GatewayConfig::default();
    let result = config::apply_overrides(&mut cfg, &["--port=not-a-number".to_string()]);
    assert!(result.is_err());
}

#[test]
fn apply_overrides_sets_string_fields_verbatim() {
    let mut cfg = config::GatewayConfig::default();
    config::apply_overrides(&mut cfg, &["--default_model=my-model".to_string()]).unwrap();
    assert_eq!(cfg.default_model, "my-model");
}
