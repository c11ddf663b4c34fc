use crate::channels::ChannelRef;
use crate::engine::StopOutcome;
use crate::state::SharedState;
use axum::{extract::State, http::StatusCode, Json};

/// 提供内嵌的控制页面
pub async fn index_handler() -> axum::response::Html<&'static str> {
    axum::response::Html(include_str!("../../static/index.html"))
}

/// 获取系统状态 API
/// 该处理函数返回系统的内存和负载信息，作为 JSON 响应
pub async fn sys_status() -> Json<serde_json::Value> {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
    }))
}

/// 当前活动流状态
pub async fn stream_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    match state.engine.status().await {
        Some(status) if status.is_running() => {
            Json(serde_json::json!({ "status": "running", "stream": status }))
        }
        Some(status) => Json(serde_json::json!({ "status": "exited", "stream": status })),
        None => Json(serde_json::json!({ "status": "stopped" })),
    }
}

/// 手动停止流 API
pub async fn handle_stop(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let message = match state.engine.stop().await {
        StopOutcome::Stopped { .. } => "Stream closed successfully",
        StopOutcome::Exited { .. } => "Stream had already exited",
        StopOutcome::NothingToStop => "No stream is running",
    };
    Json(serde_json::json!({ "message": message }))
}

/// 频道列表与收藏
pub async fn list_channels(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "channels": state.channels.list(),
        "favorites": state.favorites.list(),
    }))
}

/// 重新从 DVR 拉取 M3U
pub async fn reload_m3u(
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let url = state.config.dvr.playlist_url();
    match state.channels.reload(&state.http, &url).await {
        Ok(count) => Ok(Json(serde_json::json!({
            "message": "M3U playlist reloaded successfully",
            "count": count,
        }))),
        Err(e) => Err((StatusCode::BAD_GATEWAY, e.to_string())),
    }
}

pub async fn toggle_favorite(
    State(state): State<SharedState>,
    Json(channel): Json<ChannelRef>,
) -> Json<serde_json::Value> {
    let favorites = state.favorites.toggle(channel);
    Json(serde_json::json!({ "favorites": favorites }))
}

pub async fn save_favorites(
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state
        .favorites
        .save()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "message": "Favorites saved successfully" })))
}
