use std::{io::ErrorKind, net::IpAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::sync::Mutex;

use lumi_common::Device;

/// Key-value persistence boundary: the known device list and the last
/// selected device, stored as JSON files under the data dir.
#[derive(Clone)]
pub struct AppStore {
    devices_path: Arc<PathBuf>,
    selected_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn new() -> Self {
        let data_dir = std::env::var("LUMI_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.lumi"));
        Self::at(data_dir)
    }

    pub fn at(data_dir: PathBuf) -> Self {
        Self {
            devices_path: Arc::new(data_dir.join("devices.json")),
            selected_path: Arc::new(data_dir.join("selected.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load_devices(&self) -> anyhow::Result<Vec<Device>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.devices_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save_devices(&self, devices: &[Device]) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.devices_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(devices)?;
        tokio::fs::write(path, payload)
            .await
            .context("failed to persist device list")
    }

    pub async fn load_selected(&self) -> anyhow::Result<Option<IpAddr>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.selected_path.as_ref()).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save_selected(&self, addr: IpAddr) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.selected_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec(&addr)?;
        tokio::fs::write(path, payload)
            .await
            .context("failed to persist selected device")
    }

    pub async fn clear_selected(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(self.selected_path.as_ref()).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Default for AppStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn temp_store(tag: &str) -> AppStore {
    let dir = std::env::temp_dir().join(format!("lumi-test-{}-{}", std::process::id(), tag));
    AppStore::at(dir)
}
