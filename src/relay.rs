use crate::engine::Engine;
use axum::body::{Body, Bytes};
use futures::Stream;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::process::ChildStdout;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

/// 每次从 ffmpeg 标准输出读取的块大小
pub const CHUNK_SIZE: usize = 16 * 1024;

/// 将转码进程的标准输出转发为 HTTP 响应体
///
/// 只有客户端读取时才拉取下一块数据，慢速客户端会阻塞 ffmpeg 的管道而不是堆积缓冲。
/// 响应结束、出错或被丢弃 (客户端断开) 时，停止产生它的那一代流。
pub struct Relay {
    inner: ReaderStream<ChildStdout>,
    teardown: Option<Teardown>,
}

struct Teardown {
    engine: Arc<Engine>,
    generation: u64,
}

impl Teardown {
    fn fire(self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!("No runtime to stop stream generation {}", self.generation);
            return;
        };
        handle.spawn(async move {
            // 只停止本次转发所属的流
            self.engine.stop_generation(self.generation).await;
        });
    }
}

impl Relay {
    pub fn new(stdout: ChildStdout, engine: Arc<Engine>, generation: u64) -> Self {
        Self {
            inner: ReaderStream::with_capacity(stdout, CHUNK_SIZE),
            teardown: Some(Teardown { engine, generation }),
        }
    }

    pub fn into_body(self) -> Body {
        Body::from_stream(self)
    }

    fn finish(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown.fire();
        }
    }
}

impl Stream for Relay {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(None) => {
                info!("Transcoder output ended");
                self.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                error!("Error streaming transcoder output: {}", e);
                self.finish();
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if self.teardown.is_some() {
            info!("Client disconnected, stopping transcoder");
        }
        self.finish();
    }
}
