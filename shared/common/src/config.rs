use std::env;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub service_name: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub openai_api_key: Option<String>,
    /// Bearer token required on internal service-to-service calls.
    pub service_token: Option<String>,
    pub log_level: String,
}

impl ServiceConfig {
    pub fn from_env(service_name: &str, default_port: u16) -> Self {
        Self {
            service_name: service_name.to_string(),
            port: env::var("PORT")
                .unwrap_or_else(|_| default_port.to_string())
                .parse()
                .unwrap_or(default_port),
            database_url: env::var("DATABASE_URL").ok(),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            service_token: env::var("SERVICE_TOKEN").ok(),
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        }
    }

    pub fn service_url(&self, service: &str) -> String {
        match service {
            "sync-job" => env::var("SYNC_JOB_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8001".to_string()),
            "sync-processor" => env::var("SYNC_PROCESSOR_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8002".to_string()),
            "enrichment" => env::var("ENRICHMENT_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8003".to_string()),
            "crypto-gate" => env::var("CRYPTO_GATE_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8004".to_string()),
            "mail-relay" => env::var("MAIL_RELAY_URL")
                .unwrap_or_else(|_| "http://localhost:8010".to_string()),
            _ => format!("http://localhost:8000"),
        }
    }
}
