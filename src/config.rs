//! 命令行参数与服务默认配置。

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_STORAGE_DIR: &str = "uploads";
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 512 * 1024 * 1024;
pub const EXTRACTED_DIR: &str = "extracted";
pub const UPLOADS_URL_PREFIX: &str = "/uploads";
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// 服务的命令行参数与环境变量配置。
#[derive(Parser, Debug)]
#[command(name = "classdrop", version = VERSION_INFO, about = "Classroom homework submission server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "CLASSDROP_STORAGE_DIR",
        default_value = DEFAULT_STORAGE_DIR,
        help = "Storage root for submissions"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'b',
        long = "bind",
        env = "CLASSDROP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(long, env = "CLASSDROP_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "CLASSDROP_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload request size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
}
