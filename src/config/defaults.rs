//! Default values for configuration fields.

pub fn server_name() -> String {
    "parleyd".to_string()
}

pub fn default_lang() -> String {
    "en".to_string()
}

pub fn database_path() -> String {
    ":memory:".to_string()
}

pub fn token_key() -> String {
    // Development-only key; deployments must override it.
    "wfaY2RgF2S1OQI/ZlK+LSrp1KB2jwAdGAIHQ7JZn+Kc".to_string()
}

pub fn token_lifetime_secs() -> i64 {
    // Two weeks.
    14 * 24 * 3600
}

pub fn max_retries() -> i64 {
    4
}

pub fn restricted_tags() -> Vec<String> {
    vec!["basic".to_string(), "email".to_string(), "tel".to_string()]
}
