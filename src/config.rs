use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::PipelineOptions;
use crate::queue::QueueOptions;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server_port: u16,
    pub log_level: String,
    pub concurrency_limit: usize,
    pub dispatch_tick_ms: u64,
    pub download_retries: u32,
    pub progress_interval_ms: u64,
    pub upload_folder: String,
    pub work_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub public_url: Option<String>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            // Default settings
            .set_default("server_port", 3000)?
            .set_default("log_level", "info")?
            .set_default("concurrency_limit", 3)?
            .set_default("dispatch_tick_ms", 250)?
            .set_default("download_retries", 3)?
            .set_default("progress_interval_ms", 200)?
            .set_default("upload_folder", "Downloads")?
            .set_default("work_dir", "./data/tmp")?
            .set_default("storage_dir", "./data/storage")?
            // Config file (optional)
            .add_source(File::with_name("config").required(false))
            // Environment variables (e.g. DRIVE_RELAY_SERVER_PORT=8080)
            .add_source(Environment::with_prefix("DRIVE_RELAY"));

        builder.build()?.try_deserialize()
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            concurrency_limit: self.concurrency_limit.max(1),
            dispatch_tick: Duration::from_millis(self.dispatch_tick_ms.max(1)),
            pipeline: PipelineOptions {
                upload_folder: self.upload_folder.clone(),
                work_dir: self.work_dir.clone(),
                download_retries: self.download_retries,
                progress_interval: Duration::from_millis(self.progress_interval_ms),
                ..PipelineOptions::default()
            },
        }
    }
}
