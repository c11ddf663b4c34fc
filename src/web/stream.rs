use super::stream_error;
use crate::engine::StartedStream;
use crate::mosaic::build_command;
use crate::relay::Relay;
use crate::state::SharedState;
use crate::watchdog::{DvrActivityProbe, Watchdog};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

/// 首页表单提交的四个频道输入框
#[derive(Debug, Deserialize)]
pub struct StartForm {
    ch1: Option<String>,
    ch2: Option<String>,
    ch3: Option<String>,
    ch4: Option<String>,
}

pub async fn handle_start_form(
    Form(form): Form<StartForm>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let channels: Vec<String> = [form.ch1, form.ch2, form.ch3, form.ch4]
        .into_iter()
        .flatten()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if channels.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No channels provided".to_string()));
    }

    let query: Vec<String> = channels.iter().map(|c| format!("ch={}", c)).collect();
    Ok(Json(serde_json::json!({
        "message": format!("Stream started, access at /combine?{}", query.join("&"))
    })))
}

/// 启动拼接流: `GET /combine?ch=2.1&ch=4.1`
///
/// pipe 输出时直接返回 MPEG-TS 响应体，其余输出返回 JSON
pub async fn combine_streams(
    State(state): State<SharedState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, (StatusCode, String)> {
    // 1. 构建 ffmpeg 命令 (0 路拒绝，超过 4 路截断)
    let channels: Vec<String> = params
        .into_iter()
        .filter(|(k, _)| k == "ch")
        .map(|(_, v)| v)
        .collect();
    let command = build_command(&state.profile, &channels).map_err(stream_error)?;
    if let Some(graph) = command.filter_graph() {
        info!("Filter graph: {}", graph);
    }

    // 2. 替换当前活动流
    let started = state.engine.start(&command).await.map_err(|e| {
        error!("Failed to start stream: {}", e);
        stream_error(e)
    })?;

    // 3. 启动看门狗
    spawn_watchdog(&state, &started);

    // 4. 转发输出
    match started.stdout {
        Some(stdout) => {
            let relay = Relay::new(stdout, state.engine.clone(), started.generation);
            Ok((
                [(header::CONTENT_TYPE, "video/MP2T")],
                relay.into_body(),
            )
                .into_response())
        }
        None => Ok(Json(serde_json::json!({
            "message": format!("Stream started, output at {}", command.sink().target()),
            "pid": started.pid,
            "channels": command.channels(),
        }))
        .into_response()),
    }
}

fn spawn_watchdog(state: &SharedState, started: &StartedStream) {
    let Some(channel) = state.config.watchdog.channel.clone() else {
        return;
    };
    info!("Starting inactivity watchdog for channel {}", channel);
    let probe = DvrActivityProbe::new(state.http.clone(), state.config.dvr.activity_url());
    Watchdog::new(
        state.engine.clone(),
        probe,
        channel,
        started.generation,
        Duration::from_secs(state.config.watchdog.interval_secs),
        state.config.watchdog.threshold,
        started.cancel.clone(),
    )
    .spawn();
}
