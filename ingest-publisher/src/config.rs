use envconfig::Envconfig;

use ingest_common::config::{EnvMsDuration, KafkaConfig, NonEmptyString};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "product-events")]
    pub product_topic: NonEmptyString,

    #[envconfig(default = "ingest-publisher")]
    pub transactional_id: NonEmptyString,

    #[envconfig(default = "100")]
    pub batch_size: usize,

    #[envconfig(default = "30000")]
    pub batch_timeout: EnvMsDuration,

    #[envconfig(default = "604800")]
    pub fingerprint_ttl_secs: u64,

    /// Newline-delimited candidate records, read from stdin when unset
    pub input_path: Option<String>,

    /// Source assigned to records that do not carry one
    pub default_source: Option<NonEmptyString>,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
