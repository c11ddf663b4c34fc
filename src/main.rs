mod channels;
mod config;
mod engine;
mod error;
mod favorites;
mod hwaccel;
mod mosaic;
mod relay;
mod state;
mod watchdog;
mod web;

use axum::{
    routing::{get, post},
    Router,
};
use channels::ChannelDirectory;
use clap::Parser;
use config::{AppConfig, Overrides};
use engine::{Engine, TerminationPolicy};
use favorites::Favorites;
use mosaic::TranscodeProfile;
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Multi4Channels - DVR 多路画面拼接推流
/// 解析命令行参数与环境变量，加载配置，探测硬件编码并启动HTTP服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "multi4channels.yaml")]
    config: String,

    /// Channels DVR 地址
    #[arg(long, env = "CDVR_HOST")]
    dvr_host: Option<String>,

    #[arg(long, env = "CDVR_PORT")]
    dvr_port: Option<u16>,

    /// 看门狗监视的频道号 (留空关闭)
    #[arg(long, env = "CDVR_CHNLNUM")]
    watch_channel: Option<String>,

    /// HTTP 服务端口
    #[arg(long, env = "WEB_PAGE_PORT")]
    web_port: Option<u16>,

    /// UDP 输出端口
    #[arg(long, env = "STREAM_PORT")]
    stream_port: Option<u16>,

    /// 输出帧率
    #[arg(long, env = "OUTPUT_FPS")]
    fps: Option<f64>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            dvr_host: self.dvr_host.clone(),
            dvr_port: self.dvr_port,
            watch_channel: self.watch_channel.clone(),
            web_port: self.web_port,
            stream_port: self.stream_port,
            fps: self.fps,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，设置格式
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    // 加载配置文件并应用环境变量覆盖
    let mut config = AppConfig::load(&args.config)?;
    config.apply_overrides(&args.overrides());
    info!(
        "Multi4Channels initialized. DVR: {}, output: {}",
        config.dvr.base_url(),
        config.output.target()
    );

    // 选择视频编码器 (QuickSync / libx264)
    let encoder = hwaccel::select_encoder(config.mosaic.hwaccel).await;
    let profile = TranscodeProfile::from_config(&config, encoder);

    let http = reqwest::Client::builder()
        .timeout(config.dvr.request_timeout())
        .build()?;

    let engine = Arc::new(Engine::new(
        TerminationPolicy {
            term_grace: Duration::from_secs(config.shutdown.term_grace_secs),
            kill_grace: Duration::from_secs(config.shutdown.kill_grace_secs),
        },
        config.server.min_free_memory_kb,
    ));

    // 初始化全局状态
    let state = Arc::new(AppState {
        favorites: Favorites::load(&config.server.favorites_file),
        channels: ChannelDirectory::default(),
        config: config.clone(),
        profile,
        engine: engine.clone(),
        http,
    });

    // 预加载频道列表，失败不影响启动
    if let Err(e) = state
        .channels
        .reload(&state.http, &config.dvr.playlist_url())
        .await
    {
        warn!("Channel list unavailable at startup: {}", e);
    }

    // 注册HTTP路由
    let app = Router::new()
        .route("/", get(web::admin::index_handler)) // 首页
        .route("/sys/status", get(web::admin::sys_status)) // 系统状态
        .route("/stream", get(web::admin::stream_status)) // 当前活动流
        .route("/start", post(web::stream::handle_start_form)) // 表单提交
        .route("/combine", get(web::stream::combine_streams)) // 启动拼接流
        .route("/stop", post(web::admin::handle_stop)) // 停止流
        .route("/reload_m3u", get(web::admin::reload_m3u))
        .route("/channels", get(web::admin::list_channels))
        .route("/toggle_favorite", post(web::admin::toggle_favorite))
        .route("/save_favorites", get(web::admin::save_favorites))
        .with_state(state.clone());

    // 启动HTTP服务，监听指定的地址和端口
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down");
            // 先回收转码进程，直播响应随之结束
            engine.stop().await;
        })
        .await?;

    Ok(())
}
