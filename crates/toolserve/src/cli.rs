use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use toolserve_core::{EngineSettings, ScriptSettings};

#[derive(Debug, Parser)]
#[command(
    name = "toolserve",
    about = "Serve one configured command-line tool over HTTP",
    version
)]
pub struct Cli {
    /// Path to the tool configuration JSON file
    pub config_file_path: PathBuf,

    /// Tool timeout in minutes, fractions allowed
    #[arg(short = 't', long, value_parser = parse_minutes)]
    pub timeout: Option<f64>,

    /// Maximum number of executions running at once
    #[arg(
        short = 'r',
        long = "request-limit",
        visible_alias = "request_limit",
        default_value_t = 10,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub request_limit: u32,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Interpreter command pre-/post-scripts run under
    #[arg(long, default_value = "poetry run python")]
    pub interpreter: String,

    /// Package manager used to add and remove missing script dependencies
    #[arg(long, default_value = "poetry")]
    pub dependency_tool: String,

    /// File marking the project root scripts run in
    #[arg(long, default_value = "pyproject.toml")]
    pub project_marker: String,
}

impl Cli {
    pub const fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let scripts = ScriptSettings {
            project_marker: self.project_marker.clone(),
            ..ScriptSettings::default()
        }
        .with_interpreter_line(&self.interpreter);

        EngineSettings {
            scripts,
            ..EngineSettings::default()
        }
        .with_timeout_minutes(self.timeout)
    }
}

fn parse_minutes(s: &str) -> Result<f64, String> {
    let minutes: f64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a number of minutes"))?;
    if minutes.is_finite() && minutes > 0.0 {
        Ok(minutes)
    } else {
        Err(format!("timeout must be a positive number of minutes, got {s}"))
    }
}
