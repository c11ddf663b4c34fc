use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{LazyLock, RwLock};
use tracing::{error, info};

/// DVR 频道条目，以频道号为唯一标识
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub number: String,
    pub name: String,
}

static TVG_CHNO: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"tvg-chno="([^"]+)""#).unwrap());
static TVG_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"tvg-name="([^"]+)""#).unwrap());
static TRAILING_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",([^,]+)$").unwrap());

/// 解析 Channels DVR 的 M3U 播放列表
///
/// 频道号取自 tvg-chno，名称优先取 tvg-name，否则取行尾逗号之后的文本。
/// 条目在随后的 URL 行处提交，缺少频道号或名称的条目会被丢弃。
pub fn parse_m3u(text: &str) -> Vec<ChannelRef> {
    let mut channels = Vec::new();
    let mut number: Option<String> = None;
    let mut name: Option<String> = None;

    for line in text.lines().map(str::trim) {
        if line.starts_with("#EXTINF:") {
            if let Some(m) = TVG_CHNO.captures(line) {
                number = Some(m[1].to_string());
            }
            if let Some(m) = TVG_NAME.captures(line) {
                name = Some(m[1].to_string());
            } else if let Some(m) = TRAILING_NAME.captures(line) {
                name = Some(m[1].trim().to_string());
            }
        } else if line.starts_with("http://") {
            // take() 清空当前条目，不完整的条目不会带到下一行
            if let (Some(number), Some(name)) = (number.take(), name.take()) {
                channels.push(ChannelRef { number, name });
            }
        }
    }

    channels
}

/// 频道目录 (只读缓存，可从 DVR 重新加载)
#[derive(Default)]
pub struct ChannelDirectory {
    entries: RwLock<Vec<ChannelRef>>,
}

impl ChannelDirectory {
    pub fn list(&self) -> Vec<ChannelRef> {
        self.entries.read().unwrap().clone()
    }

    /// 从 DVR 拉取播放列表；失败时保留原有列表
    pub async fn reload(&self, client: &reqwest::Client, url: &str) -> anyhow::Result<usize> {
        let result: anyhow::Result<String> = async {
            let response = client.get(url).send().await?;
            if !response.status().is_success() {
                anyhow::bail!("Failed to fetch M3U: Status {}", response.status().as_u16());
            }
            Ok(response.text().await?)
        }
        .await;

        match result {
            Ok(text) => {
                let channels = parse_m3u(&text);
                let count = channels.len();
                *self.entries.write().unwrap() = channels;
                info!("Channels loaded: {} from M3U", count);
                Ok(count)
            }
            Err(e) => {
                error!("Error scraping M3U: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYLIST: &str = r#"#EXTM3U
#EXTINF:-1 channel-id="2" tvg-id="2" tvg-chno="2.1" tvg-name="KTVU" tvg-logo="x.png",KTVU FOX 2
http://192.168.1.151:8089/devices/ANY/channels/2.1/stream.mpg
#EXTINF:-1 tvg-chno="4.1" group-title="News",NBC Bay Area
http://192.168.1.151:8089/devices/ANY/channels/4.1/stream.mpg
#EXTINF:-1 tvg-name="No Number",No Number
http://192.168.1.151:8089/devices/ANY/channels/x/stream.mpg
#EXTINF:-1 tvg-chno="7",  ABC 7
http://192.168.1.151:8089/devices/ANY/channels/7/stream.mpg
"#;

    #[test]
    fn parses_number_and_name() {
        let channels = parse_m3u(PLAYLIST);
        assert_eq!(
            channels,
            vec![
                ChannelRef {
                    number: "2.1".to_string(),
                    name: "KTVU".to_string()
                },
                ChannelRef {
                    number: "4.1".to_string(),
                    name: "NBC Bay Area".to_string()
                },
                ChannelRef {
                    number: "7".to_string(),
                    name: "ABC 7".to_string()
                },
            ]
        );
    }

    #[test]
    fn incomplete_entries_do_not_leak_into_next() {
        let text = "#EXTINF:-1 tvg-chno=\"5\"\nhttp://a\n#EXTINF:-1 tvg-name=\"Five\"\nhttp://b\n";
        assert!(parse_m3u(text).is_empty());
    }

    #[test]
    fn empty_directory_lists_nothing() {
        assert!(ChannelDirectory::default().list().is_empty());
    }
}
