//! Diagnostic screenshots taken at login transitions

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::crawling::browser::BrowserDriver;

/// Writes `{label}_{account}.png` into a directory; disabled when no directory is set.
///
/// Failures never reach the caller.
#[derive(Debug, Clone, Default)]
pub struct SnapshotRecorder {
    dir: Option<PathBuf>,
}

impl SnapshotRecorder {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub const fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn path_for(dir: &Path, account: &str, label: &str) -> PathBuf {
        let safe_account: String = account
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        dir.join(format!("{label}_{safe_account}.png"))
    }

    /// Returns where the snapshot was written, if it was
    pub async fn capture(&self, driver: &dyn BrowserDriver, account: &str, label: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;

        let bytes = match driver.screenshot().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(account, label, error = %e, "screenshot failed");
                return None;
            }
        };

        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(account, label, error = %e, "cannot create snapshot directory");
            return None;
        }

        let path = Self::path_for(dir, account, label);
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => {
                debug!(account, label, path = %path.display(), "snapshot saved");
                Some(path)
            }
            Err(e) => {
                warn!(account, label, error = %e, "cannot write snapshot");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedBrowser;
    use tempfile::tempdir;

    #[test]
    fn file_name_is_sanitized() {
        let path = SnapshotRecorder::path_for(Path::new("/tmp"), "a/b c", "login_page");
        assert_eq!(path, PathBuf::from("/tmp/login_page_a_b_c.png"));
    }

    #[tokio::test]
    async fn writes_png_when_enabled() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let recorder = SnapshotRecorder::new(Some(dir.path().join("shots")));
        let browser = ScriptedBrowser::with_elements(Vec::new());

        let path = recorder.capture(&browser, "KR666", "page_loaded").await;
        let path = path.ok_or_else(|| anyhow::anyhow!("snapshot not written"))?;
        assert!(path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn disabled_recorder_does_nothing() {
        let browser = ScriptedBrowser::with_elements(Vec::new());
        assert!(SnapshotRecorder::disabled().capture(&browser, "KR666", "x").await.is_none());
    }

    #[tokio::test]
    async fn screenshot_failure_is_swallowed() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let recorder = SnapshotRecorder::new(Some(dir.path().to_path_buf()));
        let browser = ScriptedBrowser::with_elements(Vec::new());
        browser.fail_screenshots(true);
        assert!(recorder.capture(&browser, "KR666", "x").await.is_none());
        Ok(())
    }
}
