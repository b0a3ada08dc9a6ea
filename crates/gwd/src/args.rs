use clap::Parser;

/// OpenAI-compatible gateway in front of local llama.cpp-family engine
/// processes.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Path to the gateway's YAML configuration file.
    #[arg(short = 'c', long = "config", env = "GWD_CONFIG")]
    pub config: String,

    /// Log output format: "text" (human-readable) or "json" (structured).
    /// Overrides `server.log_format` from the config file when set.
    #[arg(long, env = "GWD_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// OTLP endpoint for exporting traces (e.g. "http://otel-collector:4318").
    #[arg(long, env = "GWD_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for OTLP authentication.
    #[arg(long, env = "GWD_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}
