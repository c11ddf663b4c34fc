use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dvr: DvrConfig,
    #[serde(default)]
    pub mosaic: MosaicConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub ffmpeg_binary: String,

    /// 启动转码前要求的最小可用内存 (KB)
    pub min_free_memory_kb: u64,

    /// 收藏频道持久化文件
    pub favorites_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9799".to_string(),
            ffmpeg_binary: "ffmpeg".to_string(),
            min_free_memory_kb: 5120,
            favorites_file: "/app/data/favorites.json".to_string(),
        }
    }
}

/// Channels DVR 上游服务
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DvrConfig {
    pub host: String,
    pub port: u16,
    /// 频道流地址模板，支持 {host} {port} {channel} 占位符
    pub channel_url_template: String,
    pub activity_path: String,
    pub playlist_path: String,
    pub request_timeout_secs: u64,
}

impl Default for DvrConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.151".to_string(),
            port: 8089,
            channel_url_template: "http://{host}:{port}/devices/ANY/channels/{channel}/stream.mpg"
                .to_string(),
            activity_path: "/dvr".to_string(),
            playlist_path: "/devices/ANY/channels.m3u".to_string(),
            request_timeout_secs: 5,
        }
    }
}

impl DvrConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn activity_url(&self) -> String {
        format!("{}{}", self.base_url(), self.activity_path)
    }

    pub fn playlist_url(&self) -> String {
        format!("{}{}", self.base_url(), self.playlist_path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LayoutStyle {
    /// xstack 网格拼接
    #[default]
    Grid,
    /// 逐层 overlay 到背景画布
    Overlay,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HwAccelMode {
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MosaicConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub layout: LayoutStyle,
    /// overlay 布局的背景图，未配置时使用纯黑画布
    pub background: Option<String>,
    pub hwaccel: HwAccelMode,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 29.97,
            video_bitrate: "5120k".to_string(),
            audio_bitrate: "128k".to_string(),
            layout: LayoutStyle::Grid,
            background: None,
            hwaccel: HwAccelMode::Auto,
        }
    }
}

/// 转码输出目标
#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputConfig {
    /// 标准输出，由 HTTP 响应转发
    #[default]
    Pipe,
    Udp {
        host: String,
        port: u16,
        #[serde(default = "default_ttl")]
        ttl: u8,
    },
    File { path: String },
}

fn default_ttl() -> u8 {
    10
}

impl OutputConfig {
    /// ffmpeg 输出参数
    pub fn target(&self) -> String {
        match self {
            OutputConfig::Pipe => "pipe:1".to_string(),
            OutputConfig::Udp { host, port, ttl } => format!("udp://{}:{}?ttl={}", host, port, ttl),
            OutputConfig::File { path } => path.clone(),
        }
    }

    /// 是否需要读取子进程标准输出
    pub fn is_pipe(&self) -> bool {
        matches!(self, OutputConfig::Pipe)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WatchdogConfig {
    /// 被监视的 DVR 频道号，为空时不启动看门狗
    pub channel: Option<String>,
    pub interval_secs: u64,
    /// 连续未观看次数达到该值后停止推流
    pub threshold: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            channel: Some("240".to_string()),
            interval_secs: 60,
            threshold: 6,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    /// SIGTERM 后的等待时间 (秒)
    pub term_grace_secs: u64,
    /// SIGKILL 后的等待时间 (秒)
    pub kill_grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            term_grace_secs: 5,
            kill_grace_secs: 2,
        }
    }
}

/// 环境变量 / 命令行覆盖项
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub dvr_host: Option<String>,
    pub dvr_port: Option<u16>,
    pub watch_channel: Option<String>,
    pub web_port: Option<u16>,
    pub stream_port: Option<u16>,
    pub fps: Option<f64>,
}

impl AppConfig {
    /// 读取 YAML 配置；文件不存在时使用内置默认值
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, o: &Overrides) {
        if let Some(host) = &o.dvr_host {
            self.dvr.host = host.clone();
        }
        if let Some(port) = o.dvr_port {
            self.dvr.port = port;
        }
        if let Some(channel) = &o.watch_channel {
            // 空字符串表示关闭看门狗
            self.watchdog.channel = Some(channel.trim().to_string()).filter(|c| !c.is_empty());
        }
        if let Some(port) = o.web_port {
            let host = self
                .server
                .listen
                .rsplit_once(':')
                .map(|(h, _)| h.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.server.listen = format!("{}:{}", host, port);
        }
        if let Some(port) = o.stream_port {
            if let OutputConfig::Udp { port: p, .. } = &mut self.output {
                *p = port;
            }
        }
        if let Some(fps) = o.fps {
            self.mosaic.fps = fps;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_uses_defaults() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9799");
        assert_eq!(config.mosaic.width, 1280);
        assert_eq!(config.output, OutputConfig::Pipe);
        assert_eq!(config.watchdog.threshold, 6);
        assert_eq!(config.shutdown.term_grace_secs, 5);
    }

    #[test]
    fn parses_udp_output_and_overlay_layout() {
        let yaml = r#"
mosaic:
  layout: overlay
  background: /app/bg.png
  hwaccel: off
output:
  type: udp
  host: 239.0.0.1
  port: 5444
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mosaic.layout, LayoutStyle::Overlay);
        assert_eq!(config.mosaic.hwaccel, HwAccelMode::Off);
        assert_eq!(config.mosaic.background.as_deref(), Some("/app/bg.png"));
        assert_eq!(
            config.output,
            OutputConfig::Udp {
                host: "239.0.0.1".to_string(),
                port: 5444,
                ttl: 10
            }
        );
    }

    #[test]
    fn overrides_replace_env_style_settings() {
        let mut config = AppConfig::default();
        config.output = OutputConfig::Udp {
            host: "127.0.0.1".to_string(),
            port: 1,
            ttl: 10,
        };
        config.apply_overrides(&Overrides {
            dvr_host: Some("10.0.0.2".to_string()),
            dvr_port: Some(9000),
            watch_channel: Some("  ".to_string()),
            web_port: Some(8080),
            stream_port: Some(5444),
            fps: Some(25.0),
        });
        assert_eq!(config.dvr.activity_url(), "http://10.0.0.2:9000/dvr");
        assert_eq!(config.watchdog.channel, None);
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert!(matches!(config.output, OutputConfig::Udp { port: 5444, .. }));
        assert_eq!(config.mosaic.fps, 25.0);
    }
}
