pub(super) fn default_name() -> String {
    "wxrelay".to_string()
}
pub(super) fn default_data_dir() -> String {
    "~/.wxrelay".to_string()
}
pub(super) fn default_log_level() -> String {
    "info".to_string()
}
pub(super) fn default_true() -> bool {
    true
}
pub(super) fn default_protocol_host() -> String {
    "127.0.0.1".to_string()
}
pub(super) fn default_protocol_port() -> u16 {
    9000
}
pub(super) fn default_poll_interval_ms() -> u64 {
    1000
}
pub(super) fn default_protocol_timeout() -> u64 {
    10
}
pub(super) fn default_dedup_window() -> u64 {
    3600
}
pub(super) fn default_max_message_age() -> u64 {
    60
}
pub(super) fn default_backend_base_url() -> String {
    "http://127.0.0.1/v1".to_string()
}
pub(super) fn default_backend_model() -> String {
    "gpt-4o-mini".to_string()
}
pub(super) fn default_backend_timeout() -> u64 {
    60
}
pub(super) fn default_single_chat_prefix() -> Vec<String> {
    vec![String::new()]
}
pub(super) fn default_group_chat_prefix() -> Vec<String> {
    vec!["@bot".to_string()]
}
pub(super) fn default_db_path() -> String {
    "~/.wxrelay/data/sessions.db".to_string()
}
pub(super) fn default_persona() -> String {
    "default".to_string()
}
pub(super) fn default_idle_ttl() -> u64 {
    86_400
}
pub(super) fn default_sweep_interval() -> u64 {
    300
}
pub(super) fn default_max_workers() -> usize {
    16
}
pub(super) fn default_max_pending() -> usize {
    64
}
