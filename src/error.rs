use thiserror::Error;

/// 推流控制路径上会返回给调用方的错误
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("No channels provided")]
    NoChannels,

    #[error("Failed to launch transcoder `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Insufficient system memory ({available_kb} KB available)")]
    InsufficientMemory { available_kb: u64 },
}

/// DVR 活动查询失败
#[derive(Debug, Error)]
pub enum PollError {
    #[error("DVR activity request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("DVR activity endpoint returned HTTP {0}")]
    Status(u16),
}
