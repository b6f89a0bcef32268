use super::{CacheZone, EntryMeta, ENTRY_META_SIZE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// How often the manager sweeps a zone.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Background cache manager: periodically walks the zone, removing entries
/// whose `valid_sec + inactive` has passed and evicting least-recently
/// stored entries once the zone exceeds `max_size`.
pub fn spawn(zone: Arc<CacheZone>, shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = sweep(&zone).await {
                        tracing::warn!("cache manager: sweep failed, zone={}, error={}", zone.name, e);
                    }
                    zone.shed_counters();
                }
                _ = shutdown.notified() => {
                    tracing::debug!("cache manager: stopping, zone={}", zone.name);
                    return;
                }
            }
        }
    })
}

struct ScannedEntry {
    path: PathBuf,
    size: u64,
    /// Store/revalidation time from the entry header.
    date: i64,
    expired_at: i64,
}

/// One full pass: collect entries, drop the inactive, then evict LRU down
/// to `max_size`.
pub async fn sweep(zone: &CacheZone) -> std::io::Result<()> {
    let mut entries = Vec::new();
    collect(&zone.root, zone.temp_dir(), 0, &mut entries).await?;

    let now = super::unix_now();
    let inactive = zone.inactive.as_secs() as i64;
    let mut total: u64 = 0;
    let mut live = Vec::new();

    for entry in entries {
        if entry.expired_at + inactive < now {
            tracing::debug!("cache manager: removing inactive entry {:?}", entry.path);
            let _ = tokio::fs::remove_file(&entry.path).await;
            continue;
        }
        total += entry.size;
        live.push(entry);
    }

    if zone.max_size > 0 && total > zone.max_size {
        // Oldest-stored first.
        live.sort_by_key(|e| e.date);
        for entry in &live {
            if total <= zone.max_size {
                break;
            }
            tracing::debug!("cache manager: evicting over-budget entry {:?}", entry.path);
            let _ = tokio::fs::remove_file(&entry.path).await;
            total -= entry.size;
        }
    }

    Ok(())
}

/// Recursive directory walk, bounded to the level depth plus slack. Files
/// whose header does not decode are skipped (a concurrent writer owns them).
async fn collect(
    dir: &Path,
    temp_dir: &Path,
    depth: usize,
    out: &mut Vec<ScannedEntry>,
) -> std::io::Result<()> {
    if dir == temp_dir || depth > 4 {
        return Ok(());
    }
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(item) = rd.next_entry().await? {
        let path = item.path();
        let file_type = item.file_type().await?;
        if file_type.is_dir() {
            Box::pin(collect(&path, temp_dir, depth + 1, out)).await?;
            continue;
        }
        let Ok(data) = tokio::fs::read(&path).await else {
            continue;
        };
        if data.len() < ENTRY_META_SIZE {
            continue;
        }
        let Ok(meta) = EntryMeta::decode(&data[..ENTRY_META_SIZE]) else {
            continue;
        };
        out.push(ScannedEntry {
            size: data.len() as u64,
            path,
            date: meta.date,
            expired_at: meta.valid_sec,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, CacheZone};
    use crate::config::CachePathConfig;
    use http::{HeaderMap, StatusCode};
    use tokio::io::AsyncWriteExt;

    fn zone_with(dir: &Path, max_size: u64, inactive: Duration) -> Arc<CacheZone> {
        CacheZone::build(
            &CachePathConfig {
                name: "m".to_string(),
                path: dir.join("cache").to_string_lossy().into_owned(),
                levels: "1:2".to_string(),
                inactive,
                max_size,
                use_temp_path: true,
            },
            dir,
        )
        .unwrap()
    }

    async fn store(zone: &CacheZone, literal: &str, body: &[u8], ttl: Duration) -> CacheKey {
        let key = CacheKey::new(literal.to_string());
        let (mut file, path, _) = zone
            .start_store(&key, StatusCode::OK, &HeaderMap::new())
            .await
            .unwrap();
        file.write_all(body).await.unwrap();
        zone.commit_store(&key, file, path, ttl, None, None)
            .await
            .unwrap();
        key
    }

    #[tokio::test]
    async fn inactive_entries_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone_with(dir.path(), 0, Duration::from_secs(0));

        let stale = store(&zone, "/stale", b"x", Duration::from_secs(0)).await;
        let fresh = store(&zone, "/fresh", b"y", Duration::from_secs(3600)).await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        sweep(&zone).await.unwrap();

        assert!(!zone.entry_path(&stale).exists());
        assert!(zone.entry_path(&fresh).exists());
    }

    #[tokio::test]
    async fn lru_eviction_respects_max_size() {
        let dir = tempfile::tempdir().unwrap();
        // Budget fits one ~204-byte entry but not two.
        let zone = zone_with(dir.path(), 300, Duration::from_secs(3600));

        let old = store(&zone, "/old", &[b'a'; 100], Duration::from_secs(3600)).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let new = store(&zone, "/new", &[b'b'; 100], Duration::from_secs(3600)).await;

        sweep(&zone).await.unwrap();

        assert!(!zone.entry_path(&old).exists(), "oldest entry evicted");
        assert!(zone.entry_path(&new).exists());
    }

    #[tokio::test]
    async fn temp_dir_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone_with(dir.path(), 0, Duration::from_secs(0));
        tokio::fs::create_dir_all(zone.temp_dir()).await.unwrap();
        let temp_file = zone.temp_dir().join("in-progress");
        tokio::fs::write(&temp_file, b"partial").await.unwrap();

        sweep(&zone).await.unwrap();
        assert!(temp_file.exists());
    }
}
