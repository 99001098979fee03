//! Configuration file watcher for hot reload.
//!
//! The parent directory is watched rather than the file itself: editors and
//! Kubernetes ConfigMap mounts replace the file (rename or `..data` symlink
//! swap) instead of writing it in place.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::read_config;
use crate::config::schema::ProxyConfig;
use crate::config::validation::validate_config;

/// Directory entry Kubernetes swaps when a mounted ConfigMap changes.
const CONFIGMAP_DATA_LINK: &str = "..data";

/// Adjustments layered over every reloaded file before validation.
pub type Overrides = Box<dyn Fn(&mut ProxyConfig) + Send + 'static>;

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    current: ProxyConfig,
    overrides: Option<Overrides>,
    update_tx: mpsc::UnboundedSender<ProxyConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// `current` is the configuration already running; reloads that parse to
    /// the same value are not forwarded. Returns the watcher and a receiver
    /// for configuration updates.
    pub fn new(path: &Path, current: ProxyConfig) -> (Self, mpsc::UnboundedReceiver<ProxyConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                current,
                overrides: None,
                update_tx,
            },
            update_rx,
        )
    }

    /// Apply `overrides` to each reloaded file; validation sees the result.
    pub fn with_overrides(mut self, overrides: impl Fn(&mut ProxyConfig) + Send + 'static) -> Self {
        self.overrides = Some(Box::new(overrides));
        self
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self {
            path,
            mut current,
            overrides,
            update_tx,
        } = self;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(|n| n.to_os_string());
        let watched = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = !event.kind.is_access()
                        && event.paths.iter().any(|p| {
                            let name = p.file_name();
                            name == file_name.as_deref() || name == Some(OsStr::new(CONFIGMAP_DATA_LINK))
                        });
                    if !relevant {
                        return;
                    }

                    let mut new_config = match read_config(&watched) {
                        Ok(config) => config,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
                            return;
                        }
                    };
                    if let Some(overrides) = &overrides {
                        overrides(&mut new_config);
                    }

                    match validate_config(&new_config) {
                        Ok(()) if new_config == current => {
                            tracing::trace!(path = ?watched, "Config file touched, content unchanged");
                        }
                        Ok(()) => {
                            tracing::info!(path = ?watched, "Config file change detected, reloading");
                            current = new_config.clone();
                            let _ = update_tx.send(new_config);
                        }
                        Err(errors) => {
                            for error in &errors {
                                tracing::error!(error = %error, "Invalid reloaded config");
                            }
                            tracing::error!(count = errors.len(), "Keeping current configuration");
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::load_config;
    use std::fs;

    #[tokio::test]
    async fn forwards_changed_config() {
        let dir = std::env::temp_dir().join(format!("kf-header-proxy-watch-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("proxy.toml");
        fs::write(&path, "[filter]\nuser_id = \"before@example.com\"\n").unwrap();

        let initial = load_config(&path).unwrap();
        let (watcher, mut updates) = ConfigWatcher::new(&path, initial);
        let _guard = watcher.run().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let staged = dir.join("proxy.toml.staged");
        fs::write(&staged, "[filter]\nuser_id = \"after@example.com\"\n").unwrap();
        fs::rename(&staged, &path).unwrap();

        let update = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let update = updates.recv().await.expect("channel closed");
                if update.filter.user_id == "after@example.com" {
                    return update;
                }
            }
        })
        .await
        .expect("no reload within timeout");
        assert_eq!(update.filter.user_id_header, "kubeflow-userid");

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn overrides_apply_before_validation() {
        let dir = std::env::temp_dir().join(format!("kf-header-proxy-watch-override-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("proxy.toml");
        fs::write(&path, "[filter]\nuser_id = \"\"\n").unwrap();

        let mut initial = read_config(&path).unwrap();
        initial.filter.user_id = "cli@example.com".into();
        let (watcher, mut updates) = ConfigWatcher::new(&path, initial);
        let watcher = watcher.with_overrides(|config| config.filter.user_id = "cli@example.com".into());
        let _guard = watcher.run().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let staged = dir.join("proxy.toml.staged");
        fs::write(&staged, "[filter]\nuser_id = \"\"\nuser_id_header = \"x-remote-user\"\n").unwrap();
        fs::rename(&staged, &path).unwrap();

        let update = tokio::time::timeout(Duration::from_secs(10), updates.recv())
            .await
            .expect("no reload within timeout")
            .expect("channel closed");
        assert_eq!(update.filter.user_id, "cli@example.com");
        assert_eq!(update.filter.user_id_header, "x-remote-user");

        let _ = fs::remove_dir_all(&dir);
    }
}
