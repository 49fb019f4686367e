use super::*;

#[test]
fn test_defaults_when_sections_missing() {
    let cfg = parse("").unwrap();
    assert_eq!(cfg.protocol.host, "127.0.0.1");
    assert_eq!(cfg.protocol.port, 9000);
    assert_eq!(cfg.protocol.version, ProtocolVersion::V849);
    assert_eq!(cfg.backend.timeout_secs, 60);
    assert_eq!(cfg.filter.ignore_mode, IgnoreMode::None);
    assert_eq!(cfg.filter.single_chat_prefix, vec![String::new()]);
    assert_eq!(cfg.filter.group_chat_prefix, vec!["@bot".to_string()]);
    assert!(cfg.filter.ignore_system_accounts);
    assert_eq!(cfg.session.default_persona, "default");
    assert_eq!(cfg.dispatch.max_workers, 16);
    assert_eq!(cfg.dispatch.max_pending, 64);
    assert!(cfg.notices.busy.contains("please wait"));
}

#[test]
fn test_full_config_from_toml() {
    let toml_str = r#"
        [protocol]
        host = "10.0.0.2"
        port = 9011
        version = "855"
        wxid = "wxid_bot"

        [backend]
        kind = "openai"
        base_url = "https://api.example.com/v1"
        api_key = "sk-test"
        response_mode = "streaming"
        timeout_secs = 30

        [filter]
        ignore_mode = "Whitelist"
        whitelist = ["wxid_alice", "123@chatroom"]
        single_chat_prefix = ["bot", "ai "]
        group_chat_prefix = ["@bot", "@assistant"]
        accept_media = ["file"]

        [session]
        default_persona = "tutor"
        group_shared_session = true

        [personas]
        tutor = "You are a patient tutor."

        [notices]
        busy = "hold on"
    "#;
    let cfg = parse(toml_str).unwrap();
    assert_eq!(cfg.protocol.base_url(), "http://10.0.0.2:9011/api");
    assert_eq!(cfg.backend.kind, BackendKind::Openai);
    assert_eq!(cfg.backend.response_mode, ResponseMode::Streaming);
    assert_eq!(cfg.filter.ignore_mode, IgnoreMode::Whitelist);
    assert_eq!(cfg.filter.whitelist.len(), 2);
    assert_eq!(cfg.filter.accept_media, vec![ContentKind::File]);
    assert!(cfg.session.group_shared_session);
    assert_eq!(cfg.notices.busy, "hold on");
    // Unset notices keep their defaults.
    assert!(cfg.notices.timeout.contains("too long"));
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_ignore_mode_accepts_lowercase() {
    let cfg = parse("[filter]\nignore_mode = \"blacklist\"").unwrap();
    assert_eq!(cfg.filter.ignore_mode, IgnoreMode::Blacklist);
}

#[test]
fn test_api_prefix_per_version() {
    assert_eq!(ProtocolVersion::V849.api_prefix(), "/VXAPI");
    assert_eq!(ProtocolVersion::V855.api_prefix(), "/api");
    assert_eq!(ProtocolVersion::Ipad.api_prefix(), "/api");
    let cfg = ProtocolConfig::default();
    assert_eq!(cfg.base_url(), "http://127.0.0.1:9000/VXAPI");
}

#[test]
fn test_validate_requires_wxid() {
    let cfg = Config::default();
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("protocol.wxid"));
}

#[test]
fn test_validate_default_persona_must_exist() {
    let mut cfg = Config::default();
    cfg.protocol.wxid = "wxid_bot".into();
    cfg.personas.insert("tutor".into(), "prompt".into());
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("default_persona"));

    cfg.session.default_persona = "tutor".into();
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_pending_covers_workers() {
    let mut cfg = Config::default();
    cfg.protocol.wxid = "wxid_bot".into();
    cfg.dispatch.max_workers = 8;
    cfg.dispatch.max_pending = 4;
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("max_pending"));
}

#[test]
fn test_invalid_toml_is_config_error() {
    let err = parse("[protocol\nport = ").unwrap_err();
    assert!(matches!(err, RelayError::Config(_)));
}

#[test]
fn test_load_missing_file_uses_defaults_and_env_key() {
    std::env::set_var(API_KEY_ENV, "env-key");
    let cfg = load("/nonexistent/__wxrelay_test__/config.toml").unwrap();
    std::env::remove_var(API_KEY_ENV);
    assert_eq!(cfg.backend.api_key, "env-key");
    assert_eq!(cfg.relay.name, "wxrelay");
}

#[test]
fn test_shellexpand_home() {
    if let Some(home) = std::env::var_os("HOME") {
        let expanded = shellexpand("~/.wxrelay/data");
        assert_eq!(
            expanded,
            format!("{}/.wxrelay/data", home.to_string_lossy())
        );
    }
    assert_eq!(shellexpand("/abs/path"), "/abs/path");
}
