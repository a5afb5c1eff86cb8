//! Atomic-ish JSON persistence with a `.old` generation, ported from
//! `original_source/notify/stat.go:writeFileWithOld` / `parseFileOrOld`.
//!
//! A write rotates the previous primary file to `.old` before writing the
//! new primary and re-writing `.old` with the same bytes (so `.old` always
//! holds the last *successfully completed* write, not a half-written one).
//! A read that fails, or whose bytes fail to parse, falls back to `.old`
//! and repairs the primary from it.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

fn old_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".old");
    PathBuf::from(name)
}

/// Serialize `value` as JSON and write it with the `.old`-generation
/// rotation described above.
pub async fn write_with_old<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let data =
        serde_json::to_vec(value).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let old = old_path(path);

    let _ = tokio::fs::remove_file(&old).await; // `.old` not existing yet is fine.
    match tokio::fs::rename(path, &old).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::write(path, &data).await?;
    tokio::fs::write(&old, &data).await?;
    Ok(())
}

/// Load and parse `path`, falling back to `<path>.old` if the primary is
/// missing or fails to parse; repairs the primary from `.old` on fallback.
/// Returns `Ok(None)` if neither file exists.
pub async fn load_or_recover<T: DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    if let Ok(buf) = tokio::fs::read(path).await {
        if let Ok(parsed) = serde_json::from_slice::<T>(&buf) {
            return Ok(Some(parsed));
        }
    }

    let old = old_path(path);
    match tokio::fs::read(&old).await {
        Ok(buf) => {
            let parsed: T = serde_json::from_slice(&buf)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            let _ = tokio::fs::write(path, &buf).await;
            Ok(Some(parsed))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        n: u32,
    }

    fn tempfile() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("edgecache-persist-test-{}.json", uuid::Uuid::new_v4()));
        p
    }

    #[tokio::test]
    async fn round_trips_through_write_and_load() {
        let path = tempfile();
        write_with_old(&path, &Sample { n: 7 }).await.unwrap();
        let loaded: Sample = load_or_recover(&path).await.unwrap().unwrap();
        assert_eq!(loaded, Sample { n: 7 });
        let _ = tokio::fs::remove_file(&path).await;
        let _ = tokio::fs::remove_file(old_path(&path)).await;
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let path = tempfile();
        let loaded: Option<Sample> = load_or_recover(&path).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn corrupted_primary_recovers_from_old_generation() {
        let path = tempfile();
        write_with_old(&path, &Sample { n: 1 }).await.unwrap();
        write_with_old(&path, &Sample { n: 2 }).await.unwrap();
        // Corrupt only the primary; `.old` still holds { n: 1 }.
        tokio::fs::write(&path, b"not json").await.unwrap();
        let loaded: Sample = load_or_recover(&path).await.unwrap().unwrap();
        assert_eq!(loaded, Sample { n: 1 });
        // Primary should have been repaired from `.old`.
        let repaired: Sample = load_or_recover(&path).await.unwrap().unwrap();
        assert_eq!(repaired, Sample { n: 1 });
        let _ = tokio::fs::remove_file(&path).await;
        let _ = tokio::fs::remove_file(old_path(&path)).await;
    }
}
