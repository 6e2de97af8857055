//! 客户端配置 - 名称服务器地址、重绑定、回退日志、KV 客户端

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{OrbError, OrbResult};

/// 名称服务器默认端口
pub const DEFAULT_NS_PORT: u16 = 13501;

/// Well-known binding of the log collector
pub const LOG_COLLECTOR_BINDING: &str = "/Orb/Services/LogCollector";

/// Well-known binding of the config store
pub const CONFIG_STORE_BINDING: &str = "/Orb/Services/ConfigStore";

/// Parse a `host[:port]` name server address.
///
/// No colon, or a colon with nothing after it, selects [`DEFAULT_NS_PORT`].
pub fn parse_ns_addr(addr: &str) -> OrbResult<(String, u16)> {
    let addr = addr.trim();
    let (host, port) = match addr.rfind(':') {
        None => (addr, DEFAULT_NS_PORT),
        Some(idx) if idx + 1 == addr.len() => (&addr[..idx], DEFAULT_NS_PORT),
        Some(idx) => {
            let port = addr[idx + 1..]
                .parse::<u16>()
                .map_err(|_| OrbError::Config(format!("bad name server port in '{addr}'")))?;
            (&addr[..idx], port)
        }
    };
    if host.is_empty() {
        return Err(OrbError::Config(format!("no name server host in '{addr}'")));
    }
    Ok((host.to_string(), port))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// 解析器配置
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// 名称服务器主机
    pub ns_host: String,
    /// 名称服务器端口
    pub ns_port: u16,
    /// `lookup` 在未指定等待时间时的默认截止时间
    pub default_lookup_wait: Duration,
    /// `make_client_proxy` 的默认等待时间
    pub default_proxy_wait: Duration,
    /// 名称服务器引导连接的默认等待时间
    pub name_server_wait: Duration,
    /// 单次轮询休眠上限
    pub retry_interval: Duration,
    /// 剩余时间低于此值时放弃重试
    pub min_remaining: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ns_host: "localhost".into(),
            ns_port: DEFAULT_NS_PORT,
            default_lookup_wait: Duration::from_secs(5),
            default_proxy_wait: Duration::from_secs(1),
            name_server_wait: Duration::from_secs(2),
            retry_interval: Duration::from_millis(500),
            min_remaining: Duration::from_millis(50),
        }
    }
}

impl ResolverConfig {
    /// 设置名称服务器地址
    pub fn with_name_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.ns_host = host.into();
        self.ns_port = port;
        self
    }

    pub fn with_name_server_wait(mut self, wait: Duration) -> Self {
        self.name_server_wait = wait;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// 自动重绑定配置
#[derive(Debug, Clone)]
pub struct RebinderConfig {
    /// 后台任务唤醒周期 (首次立即唤醒)
    pub tick_interval: Duration,
    /// 超过此时间未联系名称服务器则主动查询 cookie
    pub ping_interval: Duration,
    /// 租约续期周期
    pub lease_threshold: Duration,
    /// 连续失败超过此次数后移除绑定
    pub max_bind_failures: u32,
    /// 停止时等待后台任务退出的时间
    pub shutdown_timeout: Duration,
    /// 保留的移除记录条数
    pub removal_log_capacity: usize,
}

impl Default for RebinderConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(2500),
            ping_interval: Duration::from_secs(15),
            lease_threshold: Duration::from_secs(60),
            max_bind_failures: 10,
            shutdown_timeout: Duration::from_secs(12),
            removal_log_capacity: 32,
        }
    }
}

impl RebinderConfig {
    pub fn with_lease_threshold(mut self, threshold: Duration) -> Self {
        self.lease_threshold = threshold;
        self
    }

    pub fn with_max_bind_failures(mut self, max: u32) -> Self {
        self.max_bind_failures = max;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

/// 回退日志配置
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 本地日志文件名前缀
    pub process_name: String,
    /// 本地回退目录
    pub local_dir: PathBuf,
    /// 远程日志收集器绑定路径
    pub collector_binding: String,
    /// 队列容量
    pub queue_capacity: usize,
    /// 队列满时的重试次数
    pub enqueue_retries: u32,
    /// 重试间隔
    pub enqueue_retry_delay: Duration,
    /// 后台任务轮询队列的超时
    pub poll_interval: Duration,
    /// 两次重连尝试之间的最小间隔
    pub reconnect_throttle: Duration,
    /// 解析日志收集器代理的等待时间
    pub proxy_wait: Duration,
    /// 超过此大小换新文件
    pub rollover_size: u64,
    /// 最新文件小于此大小时继续追加
    pub reopen_size: u64,
    /// 重放时保留的最新文件数
    pub keep_files: usize,
    /// 回退时是否额外记录一条警告
    pub verbose_warnings: bool,
    /// force_local 等待后台任务空闲的时间
    pub idle_wait: Duration,
    /// 停止时等待后台任务退出的时间
    pub shutdown_timeout: Duration,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            process_name: shared::log_event::current_process_name(),
            local_dir: std::env::temp_dir().join("orb-local-logs"),
            collector_binding: LOG_COLLECTOR_BINDING.into(),
            queue_capacity: 128,
            enqueue_retries: 10,
            enqueue_retry_delay: Duration::from_millis(5),
            poll_interval: Duration::from_millis(250),
            reconnect_throttle: Duration::from_secs(5),
            proxy_wait: Duration::from_millis(100),
            rollover_size: 128 * 1024,
            reopen_size: 96 * 1024,
            keep_files: 3,
            verbose_warnings: false,
            idle_wait: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl LoggerConfig {
    pub fn new(process_name: impl Into<String>, local_dir: impl Into<PathBuf>) -> Self {
        Self {
            process_name: process_name.into(),
            local_dir: local_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_verbose_warnings(mut self, enabled: bool) -> Self {
        self.verbose_warnings = enabled;
        self
    }

    pub fn with_reconnect_throttle(mut self, throttle: Duration) -> Self {
        self.reconnect_throttle = throttle;
        self
    }

    /// 设置换文件/续写阈值
    pub fn with_file_thresholds(mut self, rollover: u64, reopen: u64) -> Self {
        self.rollover_size = rollover;
        self.reopen_size = reopen;
        self
    }
}

/// 版本化 KV 客户端配置
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// 配置存储绑定路径
    pub binding: String,
    /// 解析代理的等待时间
    pub proxy_wait: Duration,
    /// 需要加密的作用域前缀
    pub encrypted_scopes: Vec<String>,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            binding: CONFIG_STORE_BINDING.into(),
            proxy_wait: Duration::from_secs(1),
            encrypted_scopes: Vec::new(),
        }
    }
}

impl KvConfig {
    pub fn with_binding(mut self, binding: impl Into<String>) -> Self {
        self.binding = binding.into();
        self
    }

    pub fn with_encrypted_scope(mut self, scope: impl Into<String>) -> Self {
        self.encrypted_scopes.push(scope.into());
        self
    }
}

/// ORB 客户端配置
///
/// # 环境变量
///
/// | 变量 | 说明 | 默认值 |
/// |------|------|--------|
/// | ORB_NS_ADDR | 名称服务器 `host[:port]` | localhost:13501 |
/// | ORB_PROCESS_NAME | 本地日志文件前缀 | 可执行文件名 |
/// | ORB_LOCAL_LOG_DIR | 本地回退目录 | <tmp>/orb-local-logs |
/// | ORB_LEASE_THRESHOLD_SECS | 租约续期周期 | 60 |
/// | ORB_MAX_BIND_FAILURES | 绑定失败移除阈值 | 10 |
/// | ORB_LOG_QUEUE_CAPACITY | 日志队列容量 | 128 |
/// | ORB_VERBOSE_LOG_WARNINGS | 回退时记录警告 | false |
#[derive(Debug, Clone, Default)]
pub struct OrbConfig {
    pub resolver: ResolverConfig,
    pub rebinder: RebinderConfig,
    pub logger: LoggerConfig,
    pub kv: KvConfig,
}

impl OrbConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从环境变量加载配置
    pub fn from_env() -> OrbResult<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("ORB_NS_ADDR") {
            let (host, port) = parse_ns_addr(&addr)?;
            config.resolver.ns_host = host;
            config.resolver.ns_port = port;
        }
        if let Ok(name) = std::env::var("ORB_PROCESS_NAME") {
            config.logger.process_name = name;
        }
        if let Ok(dir) = std::env::var("ORB_LOCAL_LOG_DIR") {
            config.logger.local_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parse::<u64>("ORB_LEASE_THRESHOLD_SECS") {
            config.rebinder.lease_threshold = Duration::from_secs(secs);
        }
        if let Some(max) = env_parse("ORB_MAX_BIND_FAILURES") {
            config.rebinder.max_bind_failures = max;
        }
        if let Some(capacity) = env_parse::<usize>("ORB_LOG_QUEUE_CAPACITY") {
            config.logger = config.logger.with_queue_capacity(capacity);
        }
        if let Some(verbose) = env_parse("ORB_VERBOSE_LOG_WARNINGS") {
            config.logger.verbose_warnings = verbose;
        }

        Ok(config)
    }

    pub fn with_name_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.resolver = self.resolver.with_name_server(host, port);
        self
    }

    pub fn with_rebinder(mut self, rebinder: RebinderConfig) -> Self {
        self.rebinder = rebinder;
        self
    }

    pub fn with_logger(mut self, logger: LoggerConfig) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_kv(mut self, kv: KvConfig) -> Self {
        self.kv = kv;
        self
    }
}
