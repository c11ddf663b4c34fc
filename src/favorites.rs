use crate::channels::ChannelRef;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};

/// 收藏频道列表，保存为 JSON 数组
pub struct Favorites {
    path: PathBuf,
    entries: Mutex<Vec<ChannelRef>>,
}

impl Favorites {
    /// 读取收藏文件；文件缺失或损坏时返回空列表
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|s| serde_json::from_str::<Vec<ChannelRef>>(&s).map_err(Into::into))
        {
            Ok(entries) => {
                info!("Favorites loaded: {} from {:?}", entries.len(), path);
                entries
            }
            Err(e) => {
                error!("Error loading favorites from {:?}: {}", path, e);
                Vec::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn list(&self) -> Vec<ChannelRef> {
        self.entries.lock().unwrap().clone()
    }

    /// 已收藏则移除，否则追加到末尾；随后写盘
    pub fn toggle(&self, channel: ChannelRef) -> Vec<ChannelRef> {
        let snapshot = {
            let mut entries = self.entries.lock().unwrap();
            match entries.iter().position(|c| *c == channel) {
                Some(i) => {
                    entries.remove(i);
                }
                None => entries.push(channel),
            }
            entries.clone()
        };
        if let Err(e) = write_file(&self.path, &snapshot) {
            error!("Error saving favorites: {}", e);
        }
        snapshot
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let snapshot = self.list();
        write_file(&self.path, &snapshot).inspect_err(|e| error!("Error saving favorites: {}", e))
    }
}

fn write_file(path: &Path, entries: &[ChannelRef]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(entries)?)?;

    // 容器内外的不同用户都需要能改写该文件
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
    }

    info!("Favorites saved: {} to {:?}", entries.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(number: &str, name: &str) -> ChannelRef {
        ChannelRef {
            number: number.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let favorites = Favorites::load(dir.path().join("favorites.json"));
        assert!(favorites.list().is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("favorites.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Favorites::load(&path).list().is_empty());
    }

    #[test]
    fn toggle_adds_removes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("favorites.json");
        let favorites = Favorites::load(&path);

        assert_eq!(favorites.toggle(ch("2.1", "KTVU")), vec![ch("2.1", "KTVU")]);
        assert_eq!(
            favorites.toggle(ch("4.1", "NBC")),
            vec![ch("2.1", "KTVU"), ch("4.1", "NBC")]
        );
        assert_eq!(favorites.toggle(ch("2.1", "KTVU")), vec![ch("4.1", "NBC")]);

        let reloaded = Favorites::load(&path);
        assert_eq!(reloaded.list(), vec![ch("4.1", "NBC")]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o666);
        }
    }

    #[test]
    fn save_writes_current_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("favorites.json");
        std::fs::write(&path, r#"[{"number":"7","name":"ABC"}]"#).unwrap();
        let favorites = Favorites::load(&path);
        favorites.save().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"number\": \"7\""));
    }
}
