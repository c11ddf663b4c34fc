use crate::engine::{Engine, StopOutcome};
use crate::error::PollError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 查询 DVR 上某个频道是否仍在被观看
pub trait ActivityProbe: Send + Sync + 'static {
    fn is_watching(&self, channel: &str) -> impl Future<Output = Result<bool, PollError>> + Send;
}

/// 通过 `GET /dvr` 查询 Channels DVR 的当前活动
pub struct DvrActivityProbe {
    client: reqwest::Client,
    url: String,
}

impl DvrActivityProbe {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

impl ActivityProbe for DvrActivityProbe {
    fn is_watching(&self, channel: &str) -> impl Future<Output = Result<bool, PollError>> + Send {
        let needle = format!("ch{}", channel).to_lowercase();
        async move {
            let response = self.client.get(&self.url).send().await?;
            if !response.status().is_success() {
                return Err(PollError::Status(response.status().as_u16()));
            }
            let body = response.text().await?;
            Ok(body.to_lowercase().contains(&needle))
        }
    }
}

/// 单次轮询的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Watching,
    Idle,
    /// 查询失败：既不清零也不计数
    PollFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Monitoring,
    Countdown(u32),
    Stopped,
}

/// 连续未观看计数器
#[derive(Debug, Clone)]
pub struct Countdown {
    misses: u32,
    threshold: u32,
    stopped: bool,
}

impl Countdown {
    pub fn new(threshold: u32) -> Self {
        Self {
            misses: 0,
            threshold: threshold.max(1),
            stopped: false,
        }
    }

    pub fn state(&self) -> WatchdogState {
        match (self.stopped, self.misses) {
            (true, _) => WatchdogState::Stopped,
            (false, 0) => WatchdogState::Monitoring,
            (false, n) => WatchdogState::Countdown(n),
        }
    }

    pub fn observe(&mut self, tick: Tick) -> WatchdogState {
        if self.stopped {
            return WatchdogState::Stopped;
        }
        match tick {
            Tick::Watching => self.misses = 0,
            Tick::Idle => {
                self.misses += 1;
                if self.misses >= self.threshold {
                    self.stopped = true;
                }
            }
            Tick::PollFailed => {}
        }
        self.state()
    }
}

/// 看门狗退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    /// 倒计时结束并停止了推流
    StoppedStream,
    /// 所监视的流已被替换或停止
    Superseded,
}

/// 每个活动流一个看门狗，只能停止自己启动时绑定的那一代流
pub struct Watchdog<P> {
    engine: Arc<Engine>,
    probe: P,
    channel: String,
    generation: u64,
    interval: Duration,
    threshold: u32,
    cancel: CancellationToken,
}

impl<P: ActivityProbe> Watchdog<P> {
    pub fn new(
        engine: Arc<Engine>,
        probe: P,
        channel: String,
        generation: u64,
        interval: Duration,
        threshold: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            probe,
            channel,
            generation,
            // tokio 的 interval 不接受零间隔
            interval: interval.max(Duration::from_millis(1)),
            threshold,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<WatchExit> {
        tokio::spawn(self.run())
    }

    /// 轮询流程：
    /// - 首次立即查询，之后按固定间隔查询
    /// - 频道仍在被观看则清零计数，否则计数加一
    /// - 查询失败只记录日志，倒计时暂停
    /// - 计数达到阈值后停止所绑定的流并退出
    pub async fn run(self) -> WatchExit {
        let mut countdown = Countdown::new(self.threshold);
        let mut interval = tokio::time::interval(self.interval);
        info!(
            "Monitoring activity on channel {} (stream generation {})",
            self.channel, self.generation
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Watchdog for channel {} exiting: stream ended", self.channel);
                    return WatchExit::Superseded;
                }
                _ = interval.tick() => {}
            }

            if !self.engine.is_current(self.generation).await {
                info!("Watchdog for channel {} exiting: stream superseded", self.channel);
                return WatchExit::Superseded;
            }

            let tick = match self.probe.is_watching(&self.channel).await {
                Ok(true) => {
                    info!("Channel {} still being watched", self.channel);
                    Tick::Watching
                }
                Ok(false) => Tick::Idle,
                Err(e) => {
                    error!("Error checking DVR activity: {}", e);
                    Tick::PollFailed
                }
            };

            match countdown.observe(tick) {
                WatchdogState::Countdown(n) if tick == Tick::Idle => info!(
                    "Channel {} no longer being watched. Countdown to kill: {} / {}",
                    self.channel, n, self.threshold
                ),
                WatchdogState::Stopped => {
                    return match self.engine.stop_generation(self.generation).await {
                        StopOutcome::Stopped { pid, channels }
                        | StopOutcome::Exited { pid, channels, .. } => {
                            info!(
                                "Inactivity timeout on channel {}: transcoder {:?} ({}) stopped",
                                self.channel,
                                pid,
                                channels.join(", ")
                            );
                            WatchExit::StoppedStream
                        }
                        StopOutcome::NothingToStop => {
                            warn!("Inactivity timeout but stream already gone");
                            WatchExit::Superseded
                        }
                    };
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_resets_on_activity() {
        let mut c = Countdown::new(3);
        assert_eq!(c.state(), WatchdogState::Monitoring);
        assert_eq!(c.observe(Tick::Idle), WatchdogState::Countdown(1));
        assert_eq!(c.observe(Tick::Idle), WatchdogState::Countdown(2));
        assert_eq!(c.observe(Tick::Watching), WatchdogState::Monitoring);
        assert_eq!(c.observe(Tick::Idle), WatchdogState::Countdown(1));
    }

    #[test]
    fn poll_errors_pause_the_countdown() {
        let mut c = Countdown::new(2);
        assert_eq!(c.observe(Tick::PollFailed), WatchdogState::Monitoring);
        assert_eq!(c.observe(Tick::Idle), WatchdogState::Countdown(1));
        for _ in 0..5 {
            assert_eq!(c.observe(Tick::PollFailed), WatchdogState::Countdown(1));
        }
        assert_eq!(c.observe(Tick::Idle), WatchdogState::Stopped);
    }

    #[test]
    fn stops_exactly_at_ninth_tick_with_default_threshold() {
        let mut c = Countdown::new(6);
        let feed = [true, true, true, false, false, false, false, false, false];
        for (i, watching) in feed.iter().enumerate() {
            let tick = if *watching { Tick::Watching } else { Tick::Idle };
            let state = c.observe(tick);
            if i + 1 < 9 {
                assert_ne!(state, WatchdogState::Stopped, "stopped early at tick {}", i + 1);
            } else {
                assert_eq!(state, WatchdogState::Stopped);
            }
        }
        // 终止后不再变化
        assert_eq!(c.observe(Tick::Watching), WatchdogState::Stopped);
    }

    mod dvr {
        use super::*;
        use axum::{http::StatusCode, routing::get, Router};

        /// 在本地端口上模拟 DVR 的 /dvr 接口
        async fn serve(app: Router) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            format!("http://{}", addr)
        }

        fn client() -> reqwest::Client {
            reqwest::Client::builder().no_proxy().build().unwrap()
        }

        #[tokio::test]
        async fn matches_channel_case_insensitively() {
            let base = serve(Router::new().route("/dvr", get(|| async { "Watching CH240" }))).await;
            let activity = DvrActivityProbe::new(client(), format!("{}/dvr", base));

            assert!(activity.is_watching("240").await.unwrap());
            assert!(!activity.is_watching("241").await.unwrap());
        }

        #[tokio::test]
        async fn bare_number_without_ch_prefix_is_not_a_match() {
            let base = serve(Router::new().route("/dvr", get(|| async { "tuner 240 idle" }))).await;
            let activity = DvrActivityProbe::new(client(), format!("{}/dvr", base));

            assert!(!activity.is_watching("240").await.unwrap());
        }

        #[tokio::test]
        async fn idle_dvr_reports_not_watching() {
            let base = serve(Router::new().route("/dvr", get(|| async { "{\"activity\":{}}" }))).await;
            let activity = DvrActivityProbe::new(client(), format!("{}/dvr", base));

            assert!(!activity.is_watching("240").await.unwrap());
        }

        #[tokio::test]
        async fn error_status_is_a_poll_error() {
            let base = serve(Router::new().route(
                "/dvr",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            ))
            .await;
            let activity = DvrActivityProbe::new(client(), format!("{}/dvr", base));

            let err = activity.is_watching("240").await.unwrap_err();
            assert!(matches!(err, PollError::Status(500)), "{:?}", err);
        }

        #[tokio::test]
        async fn unreachable_dvr_is_a_request_error() {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);
            let activity = DvrActivityProbe::new(client(), format!("http://{}/dvr", addr));

            let err = activity.is_watching("240").await.unwrap_err();
            assert!(matches!(err, PollError::Request(_)), "{:?}", err);
        }
    }

    #[cfg(unix)]
    mod live {
        use super::*;
        use crate::config::OutputConfig;
        use crate::engine::TerminationPolicy;
        use crate::mosaic::TranscoderCommand;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Mutex;

        /// 按预设序列返回结果的探针
        struct ScriptedProbe {
            feed: Mutex<Vec<Result<bool, u16>>>,
            calls: Arc<AtomicUsize>,
        }

        impl ScriptedProbe {
            fn new(feed: Vec<Result<bool, u16>>, calls: Arc<AtomicUsize>) -> Self {
                let mut feed = feed;
                feed.reverse();
                Self {
                    feed: Mutex::new(feed),
                    calls,
                }
            }
        }

        impl ActivityProbe for ScriptedProbe {
            fn is_watching(
                &self,
                _channel: &str,
            ) -> impl Future<Output = Result<bool, PollError>> + Send {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let next = self.feed.lock().unwrap().pop().unwrap_or(Ok(false));
                async move { next.map_err(PollError::Status) }
            }
        }

        fn sleeper() -> TranscoderCommand {
            TranscoderCommand::new(
                "sleep",
                vec!["30".to_string()],
                vec!["240".to_string()],
                OutputConfig::File {
                    path: "/dev/null".to_string(),
                },
            )
        }

        fn engine() -> Arc<Engine> {
            Arc::new(Engine::new(
                TerminationPolicy {
                    term_grace: Duration::from_secs(1),
                    kill_grace: Duration::from_secs(1),
                },
                0,
            ))
        }

        #[tokio::test]
        async fn stops_stream_after_six_misses() {
            let engine = engine();
            let started = engine.start(&sleeper()).await.unwrap();
            let calls = Arc::new(AtomicUsize::new(0));
            let feed = vec![Ok(true), Ok(true), Ok(true)];
            let watchdog = Watchdog::new(
                engine.clone(),
                ScriptedProbe::new(feed, calls.clone()),
                "240".to_string(),
                started.generation,
                Duration::from_millis(10),
                6,
                started.cancel.clone(),
            );

            assert_eq!(watchdog.spawn().await.unwrap(), WatchExit::StoppedStream);
            assert_eq!(calls.load(Ordering::SeqCst), 9);
            assert!(engine.status().await.is_none());
        }

        #[tokio::test]
        async fn poll_errors_delay_the_stop() {
            let engine = engine();
            let started = engine.start(&sleeper()).await.unwrap();
            let calls = Arc::new(AtomicUsize::new(0));
            let feed = vec![Ok(false), Err(500), Err(502), Ok(false)];
            let watchdog = Watchdog::new(
                engine.clone(),
                ScriptedProbe::new(feed, calls.clone()),
                "240".to_string(),
                started.generation,
                Duration::from_millis(10),
                2,
                started.cancel.clone(),
            );

            assert_eq!(watchdog.run().await, WatchExit::StoppedStream);
            assert_eq!(calls.load(Ordering::SeqCst), 4);
        }

        #[tokio::test]
        async fn superseded_watchdog_leaves_new_stream_alone() {
            let engine = engine();
            let first = engine.start(&sleeper()).await.unwrap();
            let calls = Arc::new(AtomicUsize::new(0));
            let watchdog = Watchdog::new(
                engine.clone(),
                ScriptedProbe::new(vec![Ok(true); 100], calls.clone()),
                "240".to_string(),
                first.generation,
                Duration::from_millis(50),
                1,
                first.cancel.clone(),
            )
            .spawn();

            let second = engine.start(&sleeper()).await.unwrap();
            assert_eq!(watchdog.await.unwrap(), WatchExit::Superseded);
            assert!(engine.is_current(second.generation).await);

            engine.stop().await;
        }
    }
}
