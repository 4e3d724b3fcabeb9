// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use backtrace::Backtrace;
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fs::File, io::Read, panic::PanicInfo, path::PathBuf, process, time::Duration};
use tokio::runtime::Handle;
use tracing::error;
use tracing_subscriber::EnvFilter;
use warp::{http::StatusCode, Filter, Reply};

/// Exit code used when the process goes down because of a panic.
const PANIC_EXIT_CODE: i32 = 12;

/// ServerArgs bootstraps a server with all common pieces. And then triggers the run method for
/// the specific service.
#[derive(Parser)]
pub struct ServerArgs {
    #[clap(short, long, value_parser)]
    pub config_path: PathBuf,
}

impl ServerArgs {
    pub async fn run<C>(&self, handle: Handle) -> Result<()>
    where
        C: RunnableConfig,
    {
        // Set up the server.
        setup_logging();
        setup_panic_handler();
        let config = load::<GenericConfig<C>>(&self.config_path)?;
        config
            .validate()
            .context("Config did not pass validation")?;
        run_server_with_config(config, handle).await
    }
}

/// Runs the probes and metrics endpoint alongside the service. Returns when the service
/// returns; a dead probes endpoint takes the process down.
pub async fn run_server_with_config<C>(config: GenericConfig<C>, handle: Handle) -> Result<()>
where
    C: RunnableConfig,
{
    let health_port = config.health_check_port;
    let probes_task = handle.spawn(register_probes_and_metrics_handler(health_port));
    let main_task = handle.spawn(async move { config.run().await });

    tokio::select! {
        res = probes_task => {
            error!(
                health_check_port = health_port,
                result = ?res,
                "Probes and metrics handler exited unexpectedly"
            );
            process::exit(1);
        },
        res = main_task => {
            let res = res.context("Main task panicked or was cancelled")?;
            if let Err(e) = &res {
                error!(error = ?e, "Main task failed");
            }
            res
        },
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GenericConfig<T> {
    // Shared configuration among all services.
    pub health_check_port: u16,

    // Specific configuration for each service.
    pub server_config: T,
}

#[async_trait::async_trait]
impl<T> RunnableConfig for GenericConfig<T>
where
    T: RunnableConfig,
{
    fn validate(&self) -> Result<()> {
        self.server_config.validate()
    }

    async fn run(&self) -> Result<()> {
        self.server_config.run().await
    }

    fn get_server_name(&self) -> String {
        self.server_config.get_server_name()
    }
}

/// RunnableConfig is a trait that all services must implement for their configuration.
#[async_trait::async_trait]
pub trait RunnableConfig: Clone + DeserializeOwned + Send + Sync + 'static {
    /// Checks the config before anything is started.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    async fn run(&self) -> Result<()>;

    fn get_server_name(&self) -> String;
}

/// Parse a yaml file into a struct.
pub fn load<T: DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open the file at path: {:?}", path))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .with_context(|| format!("failed to read the file at path: {:?}", path))?;
    serde_yaml::from_str::<T>(&contents)
        .with_context(|| format!("failed to parse the config at path: {:?}", path))
}

#[derive(Debug, Serialize)]
pub struct CrashInfo {
    details: String,
    backtrace: String,
}

impl CrashInfo {
    fn from_panic(panic_info: &PanicInfo<'_>) -> Self {
        Self {
            details: format!("{}", panic_info),
            backtrace: format!("{:#?}", Backtrace::new()),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize crash info")
    }
}

/// Invoke to ensure process exits on a thread panic.
///
/// Tokio's default behavior is to catch panics and ignore them. Invoking this function will
/// ensure that all subsequent thread panics (even Tokio threads) will report the
/// details/backtrace and then exit.
pub fn setup_panic_handler() {
    std::panic::set_hook(Box::new(move |pi: &PanicInfo<'_>| {
        handle_panic(pi);
    }));
}

// Formats and logs panic information
fn handle_panic(panic_info: &PanicInfo<'_>) {
    let info = CrashInfo::from_panic(panic_info);
    let crash_info = info
        .to_toml()
        .unwrap_or_else(|_| format!("{:#?}", info));
    // Dump panic info and backtrace to logs.
    error!("{}", crash_info);
    // Also print it to stderr, in case the logger is not set up yet.
    eprintln!("{}", crash_info);
    // Give the logger a moment to flush.
    std::thread::sleep(Duration::from_millis(100));
    process::exit(PANIC_EXIT_CODE);
}

/// Set up logging for the server. JSON lines on stdout, filtered by `RUST_LOG` and
/// defaulting to `info`.
pub fn setup_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(false)
        .with_env_filter(env_filter)
        .init();
}

/// Renders everything in the default prometheus registry in the text exposition format.
pub fn encode_metrics() -> Result<Vec<u8>> {
    let metrics = prometheus::gather();
    let mut encode_buffer = vec![];
    TextEncoder::new()
        .encode(&metrics, &mut encode_buffer)
        .context("Failed to encode metrics")?;
    Ok(encode_buffer)
}

/// Register readiness and metrics handlers.
async fn register_probes_and_metrics_handler(port: u16) {
    let readiness = warp::path("readiness")
        .map(move || warp::reply::with_status("ready", StatusCode::OK).into_response());
    let metrics_endpoint = warp::path("metrics").map(|| match encode_metrics() {
        Ok(encode_buffer) => warp::reply::with_header(
            encode_buffer,
            "Content-Type",
            TextEncoder::new().format_type(),
        )
        .into_response(),
        Err(e) => {
            error!(error = ?e, "Failed to serve metrics");
            warp::reply::with_status(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response()
        },
    });
    warp::serve(readiness.or(metrics_endpoint))
        .run(([0, 0, 0, 0], port))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[derive(Clone, Debug, Deserialize, Serialize)]
    #[serde(deny_unknown_fields)]
    pub struct TestConfig {
        test: u32,
        test_name: String,
    }

    #[async_trait::async_trait]
    impl RunnableConfig for TestConfig {
        fn validate(&self) -> Result<()> {
            anyhow::ensure!(self.test > 0, "test must be positive");
            Ok(())
        }

        async fn run(&self) -> Result<()> {
            assert_eq!(self.test, 123);
            assert_eq!(self.test_name, "test");
            Ok(())
        }

        fn get_server_name(&self) -> String {
            self.test_name.clone()
        }
    }

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().expect("tempdir failure");
        let file_path = dir.path().join("testing_yaml.yaml");
        let mut file = File::create(&file_path).expect("create failure");
        file.write_all(contents.as_bytes())
            .expect("write_all failure");
        (dir, file_path)
    }

    #[tokio::test]
    async fn test_random_config_creation() {
        let (_dir, file_path) = write_config(
            r#"
            health_check_port: 12345
            server_config:
                test: 123
                test_name: "test"
            "#,
        );

        let config = load::<GenericConfig<TestConfig>>(&file_path).unwrap();
        assert_eq!(config.health_check_port, 12345);
        assert_eq!(config.get_server_name(), "test");
        assert!(config.validate().is_ok());
        run_server_with_config(config, Handle::current())
            .await
            .unwrap();
    }

    #[test]
    fn test_validation_is_delegated() {
        let (_dir, file_path) = write_config(
            r#"
            health_check_port: 12346
            server_config:
                test: 0
                test_name: "test"
            "#,
        );

        let config = load::<GenericConfig<TestConfig>>(&file_path).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let (_dir, file_path) = write_config(
            r#"
            health_check_port: 12347
            health_check_address: "0.0.0.0"
            server_config:
                test: 123
                test_name: "test"
            "#,
        );

        assert!(load::<GenericConfig<TestConfig>>(&file_path).is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let err = load::<GenericConfig<TestConfig>>(&dir.path().join("missing.yaml"))
            .unwrap_err();
        assert!(err.to_string().contains("failed to open the file"));
    }

    #[test]
    fn test_crash_info_is_toml() {
        let info = CrashInfo {
            details: "panicked at 'boom'".to_string(),
            backtrace: "frame 0".to_string(),
        };
        let toml = info.to_toml().unwrap();
        assert!(toml.contains("details = \"panicked at 'boom'\""));
        assert!(toml.contains("backtrace = \"frame 0\""));
    }

    #[test]
    fn test_encode_metrics() {
        let counter = prometheus::register_int_counter!(
            "server_framework_test_counter",
            "Counter used by the metrics encoding test"
        )
        .unwrap();
        counter.inc();
        let encoded = String::from_utf8(encode_metrics().unwrap()).unwrap();
        assert!(encoded.contains("server_framework_test_counter 1"));
    }
}
