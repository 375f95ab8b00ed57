use gpa_dispatch::config::Config;

#[test]
fn parse_example_config() {
    let raw = include_str!("../gpa-dispatch.example.toml");
    let cfg: Config = toml::from_str(raw).expect("parse TOML");
    assert_eq!(cfg.global.max_concurrency, 50);
    assert!(!cfg.paths.out_dir.is_empty());
    assert_eq!(cfg.api.api_key_env, "OPENAI_API_KEY");
}

#[test]
fn missing_sections_use_defaults() {
    let cfg: Config = toml::from_str("[global]\nmax_concurrency = 4\nprogress_interval_seconds = 0\nprint_summary = false\n")
        .expect("parse TOML");
    assert_eq!(cfg.global.max_concurrency, 4);
    assert_eq!(cfg.output.results_filename, "results.jsonl");
    assert_eq!(cfg.tokenizer.fallback_encoding, "o200k_base");
    assert!(cfg.debug.write_parse_failures);
}
