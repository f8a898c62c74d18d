//! CLI 参数、环境变量与启动校验。

use clap::Parser;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const BIND_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_BASE_DIR: &str = "public/";
pub const DEFAULT_AUTH_USER: &str = "admin";
pub const DEFAULT_SELF_DESTRUCT_DELAY_SECS: u64 = 600;
pub const AUTH_FAILURE_DELAY_SECS: u64 = 2;
pub const AUTH_REALM: &str = "drop-serve";
pub const USAGE_ROUTE: &str = "/usage.txt";
pub const INDEX_FILES: [&str; 2] = ["index.html", "index.htm"];
pub const CHECKSUM_CHUNK_SIZE: usize = 8192;
/// 上传数据单次读取的上限，超长的行会被拆成多段。
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "drop-serve", version, about = "Authenticated file drop server")]
pub struct Args {
    #[arg(
        short = 'p',
        long,
        env = "PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        short = 'd',
        long,
        env = "BASE_URL",
        default_value = DEFAULT_BASE_DIR,
        help = "Directory (relative to the working directory) to serve and upload into"
    )]
    pub base_dir: String,
    #[arg(
        long,
        env = "BASIC_AUTH_USER",
        default_value = DEFAULT_AUTH_USER,
        help = "Basic auth username"
    )]
    pub auth_user: String,
    #[arg(
        long,
        env = "BASIC_AUTH_PASSWORD",
        help = "Basic auth password (random when unset)"
    )]
    pub auth_pass: Option<String>,
    #[arg(
        long,
        env = "SELF_DESTRUCT_DELAY",
        default_value_t = DEFAULT_SELF_DESTRUCT_DELAY_SECS,
        help = "Seconds until the server shuts itself down"
    )]
    pub self_destruct_delay: u64,
}

/// 启动时构建一次、之后只读的服务配置。
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub base_dir: PathBuf,
    pub username: String,
    pub password: String,
    pub self_destruct_delay_secs: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        let password = args.auth_pass.unwrap_or_else(generate_password);
        Self {
            host: BIND_HOST,
            port: args.port,
            base_dir: PathBuf::from(args.base_dir),
            username: args.auth_user,
            password,
            self_destruct_delay_secs: args.self_destruct_delay,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// 上传与文件服务的根目录：`<cwd>/<base_dir>`。
    pub fn output_dir(&self, cwd: &Path) -> PathBuf {
        cwd.join(&self.base_dir)
    }

    /// 校验根目录存在，缺失时返回错误交由调用方退出进程。
    pub fn ensure_output_path(&self, cwd: &Path) -> Result<PathBuf, ConfigError> {
        let output_dir = self.output_dir(cwd);
        if !output_dir.is_dir() {
            return Err(ConfigError::MissingOutputDir(output_dir));
        }
        Ok(output_dir)
    }
}

fn generate_password() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug)]
pub enum ConfigError {
    MissingOutputDir(PathBuf),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingOutputDir(path) => write!(
                f,
                "unable to find {}. Terminating server.",
                path.display()
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
