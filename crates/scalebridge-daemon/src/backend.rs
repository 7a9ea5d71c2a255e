//! Backend selection.
//!
//! Opens the platform binding named by `backend.kind` and hands back the
//! adapter plus its event stream, ready for a `ConnectionManager`.

use std::sync::Arc;

use scalebridge_core::bluetooth::helper::HelperAdapter;
use scalebridge_core::{AdapterEvent, BackendKind, BluetoothAdapter, Config};
use tokio::sync::mpsc;
use tracing::info;

/// The opened platform binding.
pub struct Backend {
    adapter: Arc<dyn BluetoothAdapter>,
    helper: Option<Arc<HelperAdapter>>,
}

impl Backend {
    /// Open the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if BlueZ is selected but unreachable, or this build
    /// lacks the `bluetooth` feature.
    pub async fn open(config: &Config) -> anyhow::Result<(Self, mpsc::Receiver<AdapterEvent>)> {
        match config.backend.kind {
            BackendKind::Bluez => open_bluez().await,
            BackendKind::Helper => {
                let helper = &config.backend.helper;
                info!(program = %helper.program, args = ?helper.args, "using helper backend");
                let (adapter, events) = HelperAdapter::spawn(helper.clone(), config.retry);
                let adapter = Arc::new(adapter);
                Ok((
                    Self {
                        adapter: adapter.clone(),
                        helper: Some(adapter),
                    },
                    events,
                ))
            }
        }
    }

    /// The adapter to hand to the connection manager.
    #[must_use]
    pub fn adapter(&self) -> Arc<dyn BluetoothAdapter> {
        Arc::clone(&self.adapter)
    }

    /// Stop any supervised helper process.
    pub fn shutdown(&self) {
        if let Some(helper) = &self.helper {
            helper.shutdown();
        }
    }
}

#[cfg(feature = "bluetooth")]
async fn open_bluez() -> anyhow::Result<(Backend, mpsc::Receiver<AdapterEvent>)> {
    use anyhow::Context;
    use scalebridge_core::bluetooth::bluez::BluezAdapter;

    let (adapter, events) = BluezAdapter::new()
        .await
        .context("failed to open the BlueZ adapter")?;
    Ok((
        Backend {
            adapter: Arc::new(adapter),
            helper: None,
        },
        events,
    ))
}

#[cfg(not(feature = "bluetooth"))]
#[allow(clippy::unused_async)]
async fn open_bluez() -> anyhow::Result<(Backend, mpsc::Receiver<AdapterEvent>)> {
    anyhow::bail!(
        "this build has no BlueZ support; rebuild with `--features bluetooth` or set backend.kind = \"helper\""
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use scalebridge_core::{AdapterPower, HelperConfig};

    #[tokio::test]
    async fn test_helper_backend_starts_with_unknown_power() {
        let mut config = Config::default();
        config.backend.kind = BackendKind::Helper;
        config.backend.helper = HelperConfig {
            program: "scalebridge-helper-that-does-not-exist".into(),
            args: Vec::new(),
        };

        let (backend, _events) = Backend::open(&config).await.unwrap();
        assert_eq!(backend.adapter().power_state().await, AdapterPower::Unknown);
        backend.shutdown();
    }

    #[cfg(not(feature = "bluetooth"))]
    #[tokio::test]
    async fn test_bluez_requires_feature() {
        let config = Config::default();
        let error = Backend::open(&config).await.err().unwrap();
        assert!(error.to_string().contains("bluetooth"));
    }
}
