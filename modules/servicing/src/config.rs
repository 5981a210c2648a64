use std::env;

/// Application configuration parsed from environment variables
///
/// Every field has a default suitable for local development, so the
/// processor starts against a localhost broker/store with no environment
/// at all. Tests construct the struct directly instead of going through
/// the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub mongodb_url: String,
    pub db_name: String,
    pub inbox_stream: String,
    pub internal_stream: String,
    pub consumer_group: String,
    pub dlq_stream: String,
    pub max_retries: u64,
    pub dedup_ttl_seconds: u64,
    pub batch_size: usize,
    pub block_timeout_ms: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            mongodb_url: "mongodb://localhost:27017".to_string(),
            db_name: "billie-servicing".to_string(),
            inbox_stream: "inbox:billie-servicing".to_string(),
            internal_stream: "internal:billie-servicing".to_string(),
            consumer_group: "billie-servicing-processor".to_string(),
            dlq_stream: "dlq:billie-servicing".to_string(),
            max_retries: 3,
            dedup_ttl_seconds: 86_400,
            batch_size: 10,
            block_timeout_ms: 1000,
            log_level: "INFO".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let defaults = Config::default();

        let max_retries = parse_var("MAX_RETRIES", defaults.max_retries)?;
        let dedup_ttl_seconds = parse_var("DEDUP_TTL_SECONDS", defaults.dedup_ttl_seconds)?;
        let batch_size = parse_var("BATCH_SIZE", defaults.batch_size)?;
        let block_timeout_ms = parse_var("BLOCK_TIMEOUT_MS", defaults.block_timeout_ms)?;

        Ok(Config {
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            mongodb_url: env::var("MONGODB_URL").unwrap_or(defaults.mongodb_url),
            db_name: env::var("DB_NAME").unwrap_or(defaults.db_name),
            inbox_stream: env::var("INBOX_STREAM").unwrap_or(defaults.inbox_stream),
            internal_stream: env::var("INTERNAL_STREAM").unwrap_or(defaults.internal_stream),
            consumer_group: env::var("CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            dlq_stream: env::var("DLQ_STREAM").unwrap_or(defaults.dlq_stream),
            max_retries,
            dedup_ttl_seconds,
            batch_size,
            block_timeout_ms,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| format!("{name} must be a valid number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}
