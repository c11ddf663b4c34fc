use crate::channels::ChannelDirectory;
use crate::config::AppConfig;
use crate::engine::Engine;
use crate::favorites::Favorites;
use crate::mosaic::TranscodeProfile;
use std::sync::Arc;

/// 全局应用上下文
pub struct AppState {
    pub config: AppConfig,
    /// 启动时确定的转码参数 (含编码器选择)
    pub profile: TranscodeProfile,
    /// 唯一的转码进程管理器
    pub engine: Arc<Engine>,
    pub channels: ChannelDirectory,
    pub favorites: Favorites,
    /// 访问 DVR 的 HTTP 客户端
    pub http: reqwest::Client,
}

pub type SharedState = Arc<AppState>;
