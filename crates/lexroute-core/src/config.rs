use std::collections::HashMap;

/// Full application configuration.
/// Everything comes from env/.env; sensitive values (API keys, SMTP
/// credentials) are never persisted anywhere else.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,

    // Pipeline
    pub pipeline_tick_s: u64,
    pub pipeline_max_cases: u32,
    /// Bounded timeout applied to every oracle round trip so a hung oracle
    /// cannot hold one case's pipeline forever.
    pub oracle_timeout_s: u64,

    // Classification oracle
    pub classifier_url: String,
    pub classifier_api_key: String,
    pub classifier_model: String,

    // News search oracle
    pub news_api_url: String,
    pub news_api_key: String,
    pub news_cache_ttl_s: u64,

    // Extraction oracle
    pub extractor_url: String,

    // SMTP notification
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_pass: String,
    pub smtp_from: String,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let dotenv = parse_dotenv();
        Self {
            db_path: get_str("LEXROUTE_DB", &dotenv, "store/lexroute.db"),

            pipeline_tick_s: get_u64("PIPELINE_TICK_S", &dotenv, 10),
            pipeline_max_cases: get_u32("PIPELINE_MAX_CASES", &dotenv, 8),
            oracle_timeout_s: get_u64("ORACLE_TIMEOUT_S", &dotenv, 120),

            classifier_url: get_str(
                "CLASSIFIER_URL",
                &dotenv,
                "https://api.openai.com",
            ),
            classifier_api_key: get_str("CLASSIFIER_API_KEY", &dotenv, ""),
            classifier_model: get_str("CLASSIFIER_MODEL", &dotenv, "gpt-4o-mini"),

            news_api_url: get_str("NEWS_API_URL", &dotenv, "https://newsapi.org"),
            news_api_key: get_str("NEWS_API_KEY", &dotenv, ""),
            news_cache_ttl_s: get_u64("NEWS_CACHE_TTL_S", &dotenv, 1800),

            extractor_url: get_str("EXTRACTOR_URL", &dotenv, "http://127.0.0.1:7700"),

            smtp_host: get_str("SMTP_HOST", &dotenv, ""),
            smtp_port: get_u16("SMTP_PORT", &dotenv, 587),
            smtp_user: get_str("SMTP_USER", &dotenv, ""),
            smtp_pass: get_str("SMTP_PASS", &dotenv, ""),
            smtp_from: get_str("SMTP_FROM", &dotenv, "lexroute@localhost"),
        }
    }
}
